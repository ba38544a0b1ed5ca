//! 에러 타입 — 도메인별 에러 정의
//!
//! 각 하위 에러는 `#[from]`으로 [`SentinelError`]에 합쳐지므로
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

/// OpenSentinel 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 생명주기 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 네트워크 소켓 에러
    #[error("net error: {0}")]
    Net(#[from] NetError),

    /// 와이어 파싱 에러
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// 알림 디스패치 에러
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 생명주기 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 이미 실행 중
    #[error("pipeline already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline not running")]
    NotRunning,

    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 채널 수신 실패
    #[error("channel receive failed: {0}")]
    ChannelRecv(String),

    /// 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),
}

/// 네트워크 소켓 에러
///
/// 포트 단위 바인드 실패는 전파되지 않고 해당 포트만 건너뛰며,
/// [`NetError::FdExhausted`]만 범위 전체의 순회를 중단시킵니다.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// 소켓 생성 실패
    #[error("socket open failed ({family}): {reason}")]
    SocketOpenFailed { family: &'static str, reason: String },

    /// 바인드 실패
    #[error("bind failed on port {port} ({family}): {reason}")]
    BindFailed {
        port: u16,
        family: &'static str,
        reason: String,
    },

    /// 포트가 이미 사용 중
    #[error("address in use on port {port}")]
    AddrInUse { port: u16 },

    /// 파일 디스크립터 고갈
    #[error("file descriptors exhausted")]
    FdExhausted,

    /// 읽기 실패
    #[error("read error: {0}")]
    ReadError(String),

    /// 쓰기 실패
    #[error("write error: {0}")]
    WriteError(String),

    /// I/O 타임아웃
    #[error("timeout: {0}")]
    Timeout(String),

    /// 호스트네임 해석 실패
    #[error("resolve failed: {0}")]
    ResolveFailed(String),
}

/// 와이어 파싱 에러 (IPv4/ICMP)
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// 파싱 실패
    #[error("parse failed at offset {offset}: {reason}")]
    Failed { offset: usize, reason: String },

    /// 입력 데이터가 헤더를 담기에 부족함
    #[error("input truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

/// 알림 디스패치 에러
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// 대응 스크립트 설치 실패
    #[error("script install failed: {path}: {reason}")]
    ScriptInstall { path: String, reason: String },

    /// 외부 명령 실행 실패
    #[error("external command failed: {0}")]
    CommandFailed(String),

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}
