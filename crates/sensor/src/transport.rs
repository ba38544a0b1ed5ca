//! TCP 트랜스포트 — 수락된(또는 발신) 연결 하나의 수명
//!
//! 각 트랜스포트는 자체 tokio 태스크가 소켓을 소유하고, 읽기 루프와 FIFO
//! 쓰기 큐를 그 태스크 안에서 직렬화합니다. 핸들([`TcpTransport`])은 명령
//! 채널과 원자 카운터만 쥐고 있어 어느 스레드에서든 관측/제어가 가능합니다.
//!
//! 수명 규칙:
//! - 읽기/쓰기 에러와 타임아웃은 모두 터미널이며 태스크를 종료시킵니다.
//! - `stop()`은 멱등합니다. 쓰기 큐는 플러시하지 않고 버립니다.
//! - 태스크 종료 시 상태가 `Disconnected`가 되고 소켓은 half-close 후
//!   닫힙니다. 이후 어떤 콜백도 호출되지 않습니다.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::debug;

use crate::error::TransportError;

/// 읽기 루프가 재사용하는 고정 버퍼 크기
pub const READ_BUFFER_SIZE: usize = 8192;

/// 발신 연결 타임아웃
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// 연결 직후 첫 틱까지의 간격
const TICK_INITIAL: Duration = Duration::from_secs(1);

/// 연결된 뒤의 틱 간격 (대역폭 이동 윈도우 갱신)
const TICK_CONNECTED: Duration = Duration::from_secs(8);

/// 대역폭 집계 윈도우 (밀리초)
const BANDWIDTH_WINDOW_MS: u64 = 1_000;

/// 읽기 콜백 — 유효 바이트 슬라이스를 전달합니다.
///
/// 버퍼는 재사용되므로 수신측은 콜백 밖으로 슬라이스를 보존할 수 없습니다
/// (타입 수준에서 강제됩니다). 보존이 필요하면 복사하십시오.
pub type OnRead = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// 발신 연결 완료 콜백
pub type OnComplete = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// 트랜스포트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    /// 소켓 없음 (종료됨 포함)
    Disconnected = 0,
    /// 발신 연결 진행 중
    Connecting = 1,
    /// 소켓 연결됨
    Connected = 2,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// 트랜스포트 동작 옵션
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// 읽기 한 번당 타임아웃. `None`이면 무제한.
    pub read_timeout: Option<Duration>,
    /// 쓰기 한 프레임당 타임아웃. `None`이면 무제한.
    pub write_timeout: Option<Duration>,
    /// 쓰기 큐가 비면 종료할지 여부
    pub close_after_writes: bool,
    /// 발신 연결 타임아웃
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            write_timeout: None,
            close_after_writes: false,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// 바이트 수 집계 — 누적/구간 카운터와 구간 속도
///
/// 트랜스포트 태스크가 갱신하고 핸들이 읽는 공유 상태입니다.
/// 구간이 [`BANDWIDTH_WINDOW_MS`]를 넘으면 구간 카운터를 재설정하고
/// 구간 시작점을 전진시킵니다.
#[derive(Debug)]
pub struct TransportMetrics {
    bytes_total_read: AtomicU64,
    bytes_total_write: AtomicU64,
    interval_read: AtomicU64,
    interval_write: AtomicU64,
    interval_read_start_ms: AtomicU64,
    interval_write_start_ms: AtomicU64,
    rate_read: AtomicU64,
    rate_write: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TransportMetrics {
    fn new() -> Self {
        let now = now_ms();
        Self {
            bytes_total_read: AtomicU64::new(0),
            bytes_total_write: AtomicU64::new(0),
            interval_read: AtomicU64::new(0),
            interval_write: AtomicU64::new(0),
            interval_read_start_ms: AtomicU64::new(now),
            interval_write_start_ms: AtomicU64::new(now),
            rate_read: AtomicU64::new(0),
            rate_write: AtomicU64::new(0),
        }
    }

    /// 누적 읽기 바이트
    pub fn bytes_total_read(&self) -> u64 {
        self.bytes_total_read.load(Ordering::Relaxed)
    }

    /// 누적 쓰기 바이트
    pub fn bytes_total_write(&self) -> u64 {
        self.bytes_total_write.load(Ordering::Relaxed)
    }

    /// 현재 구간의 읽기 속도 (구간 바이트 / 구간 밀리초)
    pub fn bytes_per_second_read(&self) -> u64 {
        self.rate_read.load(Ordering::Relaxed)
    }

    /// 현재 구간의 쓰기 속도 (구간 바이트 / 구간 밀리초)
    pub fn bytes_per_second_write(&self) -> u64 {
        self.rate_write.load(Ordering::Relaxed)
    }

    /// 마지막 읽기 구간 시작 이후 경과 시간 (초, 최소 1초 단위)
    pub fn seconds_since_last_read(&self) -> u64 {
        elapsed_secs(self.interval_read_start_ms.load(Ordering::Relaxed))
    }

    /// 마지막 쓰기 구간 시작 이후 경과 시간 (초, 최소 1초 단위)
    pub fn seconds_since_last_write(&self) -> u64 {
        elapsed_secs(self.interval_write_start_ms.load(Ordering::Relaxed))
    }

    fn record_read(&self, n: u64) {
        self.bytes_total_read.fetch_add(n, Ordering::Relaxed);
        let interval = self.interval_read.fetch_add(n, Ordering::Relaxed) + n;
        Self::roll_window(
            interval,
            &self.interval_read,
            &self.interval_read_start_ms,
            &self.rate_read,
        );
    }

    fn record_write(&self, n: u64) {
        self.bytes_total_write.fetch_add(n, Ordering::Relaxed);
        let interval = self.interval_write.fetch_add(n, Ordering::Relaxed) + n;
        Self::roll_window(
            interval,
            &self.interval_write,
            &self.interval_write_start_ms,
            &self.rate_write,
        );
    }

    fn roll_window(
        interval_bytes: u64,
        interval: &AtomicU64,
        start_ms: &AtomicU64,
        rate: &AtomicU64,
    ) {
        let now = now_ms();
        let elapsed = now.saturating_sub(start_ms.load(Ordering::Relaxed));
        if elapsed > 0 {
            rate.store(interval_bytes / elapsed, Ordering::Relaxed);
            if elapsed >= BANDWIDTH_WINDOW_MS {
                interval.store(0, Ordering::Relaxed);
                start_ms.store(now, Ordering::Relaxed);
            }
        }
    }

    /// 틱마다 호출 — 소켓이 유휴 상태여도 속도를 다시 계산합니다.
    /// 트래픽이 없으면 경과 시간이 늘어나며 속도가 0으로 수렴합니다.
    fn refresh(&self) {
        let now = now_ms();

        let elapsed = now.saturating_sub(self.interval_read_start_ms.load(Ordering::Relaxed));
        if elapsed > 0 {
            let bytes = self.interval_read.load(Ordering::Relaxed);
            self.rate_read.store(bytes / elapsed, Ordering::Relaxed);
        }

        let elapsed = now.saturating_sub(self.interval_write_start_ms.load(Ordering::Relaxed));
        if elapsed > 0 {
            let bytes = self.interval_write.load(Ordering::Relaxed);
            self.rate_write.store(bytes / elapsed, Ordering::Relaxed);
        }
    }
}

fn elapsed_secs(start_ms: u64) -> u64 {
    let diff = now_ms().saturating_sub(start_ms);
    if diff == 0 {
        0
    } else {
        diff.max(1_000) / 1_000
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    peer_addr: OnceLock<SocketAddr>,
    metrics: TransportMetrics,
}

impl Shared {
    fn new(state: TransportState) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            peer_addr: OnceLock::new(),
            metrics: TransportMetrics::new(),
        }
    }

    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[derive(Debug)]
enum Command {
    Write(Bytes),
    Stop,
}

/// 트랜스포트 핸들
///
/// 핸들이 모두 버려져도 태스크는 소켓이 닫힐 때까지 계속 동작하므로,
/// 레지스트리는 `is_stopped()`로 수확 시점을 판단합니다.
#[derive(Debug)]
pub struct TcpTransport {
    id: u64,
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TcpTransport {
    /// 레지스트리 키로 쓰이는 고유 식별자
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 현재 상태
    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    /// 종결 여부 — 태스크가 끝나고 소켓이 닫혔으면 true
    pub fn is_stopped(&self) -> bool {
        self.shared.state() == TransportState::Disconnected
    }

    /// 상대 주소 (발신 연결은 연결 완료 후에 확정)
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr.get().copied()
    }

    /// 바이트 집계 관측 상태
    pub fn metrics(&self) -> &TransportMetrics {
        &self.shared.metrics
    }

    /// 프레임을 쓰기 큐에 추가합니다. FIFO 순서로 플러시됩니다.
    ///
    /// 아직 연결 전이면 큐에 쌓였다가 연결 직후 플러시됩니다.
    /// 이미 종결된 트랜스포트에 대한 호출은 무시됩니다.
    pub fn write(&self, bytes: Bytes) {
        let _ = self.cmd_tx.send(Command::Write(bytes));
    }

    /// 트랜스포트를 종결합니다. 멱등합니다.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// 발신 연결을 시작합니다.
    ///
    /// 호스트네임 해석과 연결을 [`TransportOptions::connect_timeout`] 안에
    /// 끝내지 못하면 `ConnectTimeout`, 해석/연결 자체가 실패하면
    /// `ConnectFailed`가 `on_complete`로 보고됩니다. 연결 성공 시 큐에 쌓인
    /// 쓰기가 먼저 플러시되고 읽기 루프가 시작됩니다.
    pub fn connect(
        host: String,
        port: u16,
        options: TransportOptions,
        on_read: Option<OnRead>,
        on_complete: OnComplete,
    ) -> Self {
        let shared = Arc::new(Shared::new(TransportState::Connecting));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let connected = timeout(options.connect_timeout, dial(&host, port)).await;

            let stream = match connected {
                Err(_) => {
                    debug!(host = %host, port, "transport connect timed out, closing");
                    task_shared.set_state(TransportState::Disconnected);
                    on_complete(Err(TransportError::ConnectTimeout));
                    return;
                }
                Ok(Err(err)) => {
                    debug!(host = %host, port, error = %err, "transport connect failed");
                    task_shared.set_state(TransportState::Disconnected);
                    on_complete(Err(err));
                    return;
                }
                Ok(Ok(stream)) => stream,
            };

            if let Ok(peer) = stream.peer_addr() {
                let _ = task_shared.peer_addr.set(peer);
            }
            task_shared.set_state(TransportState::Connected);
            on_complete(Ok(()));

            run_loop(stream, task_shared, cmd_rx, options, on_read).await;
        });

        Self { id, shared, cmd_tx }
    }

    /// 수락된 연결로부터 트랜스포트 태스크를 시작합니다.
    fn start_accepted(
        stream: TcpStream,
        peer: SocketAddr,
        options: TransportOptions,
        on_read: Option<OnRead>,
    ) -> Self {
        let shared = Arc::new(Shared::new(TransportState::Connected));
        let _ = shared.peer_addr.set(peer);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            run_loop(stream, task_shared, cmd_rx, options, on_read).await;
        });

        Self { id, shared, cmd_tx }
    }
}

/// 수락 직후, 읽기 루프를 시작하기 전의 설정 단계
///
/// 수락 콜백은 이 빌더로 타임아웃과 읽기 핸들러를 설정한 뒤 [`start`]를
/// 호출합니다. `start` 전에는 어떤 읽기도 일어나지 않습니다.
///
/// [`start`]: AcceptedConnection::start
pub struct AcceptedConnection {
    stream: TcpStream,
    peer: SocketAddr,
    options: TransportOptions,
    on_read: Option<OnRead>,
}

impl AcceptedConnection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            options: TransportOptions::default(),
            on_read: None,
        }
    }

    /// 상대 주소
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 읽기 타임아웃을 설정합니다.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.options.read_timeout = timeout;
    }

    /// 쓰기 타임아웃을 설정합니다.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.options.write_timeout = timeout;
    }

    /// 쓰기 큐가 빌 때 종결할지 설정합니다.
    pub fn set_close_after_writes(&mut self, flag: bool) {
        self.options.close_after_writes = flag;
    }

    /// 읽기 콜백을 설치합니다.
    pub fn set_on_read(&mut self, f: impl FnMut(&[u8]) + Send + 'static) {
        self.on_read = Some(Box::new(f));
    }

    /// 읽기 루프를 시작하고 핸들을 반환합니다.
    pub fn start(self) -> TcpTransport {
        TcpTransport::start_accepted(self.stream, self.peer, self.options, self.on_read)
    }
}

async fn dial(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

    let mut last_err = TransportError::ConnectFailed("no addresses resolved".to_owned());
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = TransportError::ConnectFailed(e.to_string()),
        }
    }
    Err(last_err)
}

/// 트랜스포트 메인 루프 — 소켓과 쓰기 큐를 단독으로 소유합니다.
async fn run_loop(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    options: TransportOptions,
    mut on_read: Option<OnRead>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut write_queue: VecDeque<Bytes> = VecDeque::new();
    let mut wrote_any = false;
    let mut tick_deadline = Instant::now() + TICK_INITIAL;
    // 읽기 타이머는 읽기가 완료될 때만 재장전됩니다. 다른 이벤트(틱, 쓰기
    // 명령)가 select를 깨워도 데드라인은 유지됩니다.
    let mut read_deadline = options.read_timeout.map(|t| Instant::now() + t);

    'run: loop {
        // 큐에 쌓인 쓰기를 먼저 FIFO로 비웁니다.
        while let Some(frame) = write_queue.pop_front() {
            match write_frame(&mut wr, &frame, options.write_timeout).await {
                Ok(()) => {
                    shared.metrics.record_write(frame.len() as u64);
                    wrote_any = true;
                }
                Err(err) => {
                    debug!(error = %err, "transport write failed, closing");
                    break 'run;
                }
            }
        }

        if wrote_any && write_queue.is_empty() && options.close_after_writes {
            debug!("transport write queue is empty, closing");
            break 'run;
        }

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Write(bytes)) => write_queue.push_back(bytes),
                    Some(Command::Stop) | None => break 'run,
                }
            }
            result = read_some(&mut rd, &mut read_buf, read_deadline) => {
                match result {
                    Ok(0) => {
                        debug!("transport peer closed connection");
                        break 'run;
                    }
                    Ok(n) => {
                        shared.metrics.record_read(n as u64);
                        read_deadline = options.read_timeout.map(|t| Instant::now() + t);
                        if let Some(cb) = on_read.as_mut() {
                            cb(&read_buf[..n]);
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "transport read failed, closing");
                        break 'run;
                    }
                }
            }
            _ = sleep_until(tick_deadline) => {
                shared.metrics.refresh();
                tick_deadline = Instant::now() + TICK_CONNECTED;
            }
        }
    }

    // 종결: 상태 전이 후 half-close, 콜백 해제. 남은 쓰기 큐는 버립니다.
    shared.set_state(TransportState::Disconnected);
    if let Err(err) = wr.shutdown().await {
        debug!(error = %err, "transport socket shutdown error");
    }
    drop(on_read);
}

async fn read_some(
    rd: &mut OwnedReadHalf,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<usize, TransportError> {
    match deadline {
        Some(deadline) => match timeout_at(deadline, rd.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(TransportError::ReadError(e.to_string())),
            Err(_) => Err(TransportError::ReadTimeout),
        },
        None => rd
            .read(buf)
            .await
            .map_err(|e| TransportError::ReadError(e.to_string())),
    }
}

async fn write_frame(
    wr: &mut OwnedWriteHalf,
    frame: &[u8],
    write_timeout: Option<Duration>,
) -> Result<(), TransportError> {
    match write_timeout {
        Some(limit) => match timeout(limit, wr.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::WriteError(e.to_string())),
            Err(_) => Err(TransportError::WriteTimeout),
        },
        None => wr
            .write_all(frame)
            .await
            .map_err(|e| TransportError::WriteError(e.to_string())),
    }
}
