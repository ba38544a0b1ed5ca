//! 도메인 타입 — 위협 관측과 알림의 공통 데이터 구조
//!
//! 모든 센서(TCP/UDP/ICMP)는 관측 결과를 [`Threat`]로 표현하고,
//! 분류기를 통과한 위협은 [`Alert`]로 변환되어 외부 명령에 전달됩니다.

use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 위협 샘플의 최대 보관 크기 (바이트)
///
/// 관측 시점에 이 크기를 넘는 데이터는 잘라서 보관합니다.
pub const MAX_SAMPLE_BYTES: usize = 65_535;

/// 알림 표시 문자열에 포함되는 샘플의 최대 크기 (바이트)
pub const MAX_DISPLAY_SAMPLE_BYTES: usize = 1_536;

/// 관측된 트래픽의 전송 프로토콜
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// 프로토콜 미지정
    #[default]
    None,
    /// TCP 연결 수락 또는 수신 데이터
    Tcp,
    /// UDP 데이터그램
    Udp,
    /// ICMP echo request/reply
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Icmp => write!(f, "ICMP"),
        }
    }
}

/// 위협 심각도 — L0(위협 아님)부터 L5까지 단조 증가
///
/// `Ord` 구현으로 심각도 비교가 가능합니다
/// (`Level0 < Level1 < ... < Level5`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ThreatLevel {
    /// 위협 아님
    #[default]
    Level0,
    /// 빈 접촉 (연결만 시도)
    Level1,
    /// 페이로드를 동반한 접촉
    Level2,
    /// 알려진 적대 패턴 또는 프로토콜 자체가 의심스러운 접촉
    Level3,
    /// 예약됨
    Level4,
    /// 예약됨
    Level5,
}

impl ThreatLevel {
    /// 숫자 값 (0..=5)을 반환합니다.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Level0 => 0,
            Self::Level1 => 1,
            Self::Level2 => 2,
            Self::Level3 => 3,
            Self::Level4 => 4,
            Self::Level5 => 5,
        }
    }

    /// 지문에 쓰이는 짧은 태그 (`L0`..`L5`)를 반환합니다.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Level0 => "L0",
            Self::Level1 => "L1",
            Self::Level2 => "L2",
            Self::Level3 => "L3",
            Self::Level4 => "L4",
            Self::Level5 => "L5",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LEVEL_{}", self.as_u8())
    }
}

/// 위협 관측 레코드
///
/// 센서가 관측 시점에 생성하고, 분류기가 `level`을 한 번 갱신한 뒤에는
/// 읽기 전용으로 취급됩니다. 샘플은 [`MAX_SAMPLE_BYTES`]로 제한됩니다.
#[derive(Debug, Clone)]
pub struct Threat {
    protocol: Protocol,
    address: IpAddr,
    port: u16,
    buffer: Bytes,
    level: ThreatLevel,
}

impl Threat {
    /// 새 위협 관측을 생성합니다. 심각도는 `Level0`에서 시작합니다.
    pub fn new(protocol: Protocol, address: IpAddr, port: u16, buffer: Bytes) -> Self {
        let buffer = if buffer.len() > MAX_SAMPLE_BYTES {
            buffer.slice(..MAX_SAMPLE_BYTES)
        } else {
            buffer
        };
        Self {
            protocol,
            address,
            port,
            buffer,
            level: ThreatLevel::Level0,
        }
    }

    /// 샘플 없는 위협 관측을 생성합니다 (TCP accept, ICMP echo 등).
    pub fn without_sample(protocol: Protocol, address: IpAddr, port: u16) -> Self {
        Self::new(protocol, address, port, Bytes::new())
    }

    /// 전송 프로토콜
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// 상대 IP 주소
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// 상대 포트 (ICMP는 0)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 관측된 샘플 바이트
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    /// 샘플이 존재하는지 확인합니다.
    pub fn has_payload(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// 현재 심각도
    pub fn level(&self) -> ThreatLevel {
        self.level
    }

    /// 심각도를 직접 지정합니다 (센서가 관측 시점에 사용).
    pub fn set_level(&mut self, level: ThreatLevel) {
        self.level = level;
    }

    /// 주어진 심각도가 현재보다 높을 때만 갱신합니다.
    ///
    /// 상류(UDP/ICMP 센서)에서 이미 지정한 높은 심각도는 보존됩니다.
    pub fn escalate_to(&mut self, level: ThreatLevel) {
        if level > self.level {
            self.level = level;
        }
    }

    /// 로그 출력용 샘플 미리보기 — 최대 256바이트를 lossy UTF-8로 보여줍니다.
    pub fn sample_preview(&self) -> String {
        let end = self.buffer.len().min(256);
        String::from_utf8_lossy(&self.buffer[..end]).into_owned()
    }
}

impl fmt::Display for Threat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} proto={} level={} sample={}B",
            self.address,
            self.port,
            self.protocol,
            self.level,
            self.buffer.len(),
        )
    }
}

/// 외부 통지 대상으로 선택된 위협
///
/// 중복 제거 키인 [`fingerprint`](Alert::fingerprint)와 외부 명령의 인자인
/// [`display`](Alert::display)를 제공합니다.
#[derive(Debug, Clone)]
pub struct Alert {
    threat: Threat,
}

impl Alert {
    /// 분류가 끝난 위협에서 알림을 생성합니다.
    pub fn new(threat: Threat) -> Self {
        Self { threat }
    }

    /// 알림이 감싼 위협
    pub fn threat(&self) -> &Threat {
        &self.threat
    }

    /// 중복 제거 지문: `address:PROTO:Ln:has_payload`
    ///
    /// 페이로드는 존재 여부(bool)로만 반영되므로, 같은 주소가 내용만 다른
    /// 샘플을 반복 전송해도 하나의 지문으로 묶입니다.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.threat.address,
            self.threat.protocol,
            self.threat.level.tag(),
            self.threat.has_payload(),
        )
    }

    /// 외부 명령 인자: `ip:port,PROTO,LEVEL_n,[HTTP_태그 ]hex(sample)`
    ///
    /// 샘플은 [`MAX_DISPLAY_SAMPLE_BYTES`]까지만 포함되며, `HTTP/` 문자열과
    /// 메서드 토큰이 함께 보이면 해당 태그가 hex 덤프 앞에 붙습니다.
    pub fn display(&self) -> String {
        let mut out = format!(
            "{}:{},{},{},",
            self.threat.address, self.threat.port, self.threat.protocol, self.threat.level,
        );

        if self.threat.has_payload() {
            let sample =
                &self.threat.buffer[..self.threat.buffer.len().min(MAX_DISPLAY_SAMPLE_BYTES)];

            if let Some(tag) = http_method_tag(sample) {
                out.push_str(tag);
                out.push(' ');
            }

            out.push_str(&hex_string(sample));
        }

        out
    }
}

/// 샘플에서 HTTP 요청을 식별합니다.
///
/// `HTTP/` 부분 문자열이 있을 때만 메서드 토큰을 찾습니다.
fn http_method_tag(sample: &[u8]) -> Option<&'static str> {
    if !contains(sample, b"HTTP/") {
        return None;
    }
    if contains(sample, b"GET") {
        Some("HTTP_GET")
    } else if contains(sample, b"POST") {
        Some("HTTP_POST")
    } else if contains(sample, b"HEAD") {
        Some("HTTP_HEAD")
    } else {
        None
    }
}

/// 바이트 열에서 부분 수열을 찾습니다.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// 소문자 hex 덤프 (구분자 없음)
pub fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_threat(sample: &'static [u8], level: ThreatLevel) -> Threat {
        let mut t = Threat::new(
            Protocol::Tcp,
            "203.0.113.5".parse().unwrap(),
            1234,
            Bytes::from_static(sample),
        );
        t.set_level(level);
        t
    }

    #[test]
    fn protocol_display() {
        assert_eq!(Protocol::None.to_string(), "NONE");
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
        assert_eq!(Protocol::Icmp.to_string(), "ICMP");
    }

    #[test]
    fn level_ordering() {
        assert!(ThreatLevel::Level0 < ThreatLevel::Level1);
        assert!(ThreatLevel::Level1 < ThreatLevel::Level2);
        assert!(ThreatLevel::Level2 < ThreatLevel::Level3);
        assert!(ThreatLevel::Level3 < ThreatLevel::Level5);
    }

    #[test]
    fn level_display_and_tag() {
        assert_eq!(ThreatLevel::Level0.to_string(), "LEVEL_0");
        assert_eq!(ThreatLevel::Level3.to_string(), "LEVEL_3");
        assert_eq!(ThreatLevel::Level1.tag(), "L1");
        assert_eq!(ThreatLevel::Level5.as_u8(), 5);
    }

    #[test]
    fn threat_starts_at_level_zero() {
        let t = Threat::without_sample(Protocol::Tcp, "10.0.0.1".parse().unwrap(), 80);
        assert_eq!(t.level(), ThreatLevel::Level0);
        assert!(!t.has_payload());
    }

    #[test]
    fn threat_sample_is_capped() {
        let big = Bytes::from(vec![0x41; MAX_SAMPLE_BYTES + 100]);
        let t = Threat::new(Protocol::Udp, "10.0.0.1".parse().unwrap(), 69, big);
        assert_eq!(t.buffer().len(), MAX_SAMPLE_BYTES);
    }

    #[test]
    fn escalate_only_raises() {
        let mut t = Threat::without_sample(Protocol::Udp, "10.0.0.1".parse().unwrap(), 69);
        t.set_level(ThreatLevel::Level3);
        t.escalate_to(ThreatLevel::Level2);
        assert_eq!(t.level(), ThreatLevel::Level3);
        t.escalate_to(ThreatLevel::Level5);
        assert_eq!(t.level(), ThreatLevel::Level5);
    }

    #[test]
    fn sample_preview_is_bounded() {
        let t = Threat::new(
            Protocol::Tcp,
            "10.0.0.1".parse().unwrap(),
            80,
            Bytes::from(vec![b'x'; 1000]),
        );
        assert_eq!(t.sample_preview().len(), 256);
    }

    #[test]
    fn fingerprint_format() {
        let alert = Alert::new(tcp_threat(b"", ThreatLevel::Level1));
        assert_eq!(alert.fingerprint(), "203.0.113.5:TCP:L1:false");

        let alert = Alert::new(tcp_threat(b"FOO", ThreatLevel::Level3));
        assert_eq!(alert.fingerprint(), "203.0.113.5:TCP:L3:true");
    }

    #[test]
    fn fingerprint_ignores_sample_content() {
        let a = Alert::new(tcp_threat(b"abc", ThreatLevel::Level2));
        let b = Alert::new(tcp_threat(b"xyz!", ThreatLevel::Level2));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn display_without_payload() {
        let alert = Alert::new(tcp_threat(b"", ThreatLevel::Level1));
        assert_eq!(alert.display(), "203.0.113.5:1234,TCP,LEVEL_1,");
    }

    #[test]
    fn display_with_binary_payload() {
        let alert = Alert::new(tcp_threat(b"FOO", ThreatLevel::Level3));
        assert_eq!(alert.display(), "203.0.113.5:1234,TCP,LEVEL_3,464f4f");
    }

    #[test]
    fn display_tags_http_get() {
        let alert = Alert::new(tcp_threat(b"GET / HTTP/1.1\r\n\r\n", ThreatLevel::Level2));
        let display = alert.display();
        assert!(display.starts_with("203.0.113.5:1234,TCP,LEVEL_2,HTTP_GET "));
        assert!(display.ends_with(&hex_string(b"GET / HTTP/1.1\r\n\r\n")));
    }

    #[test]
    fn display_tags_http_post_and_head() {
        let post = Alert::new(tcp_threat(b"POST /x HTTP/1.0\r\n", ThreatLevel::Level2));
        assert!(post.display().contains("HTTP_POST "));

        let head = Alert::new(tcp_threat(b"HEAD / HTTP/1.1\r\n", ThreatLevel::Level2));
        assert!(head.display().contains("HTTP_HEAD "));
    }

    #[test]
    fn display_no_tag_without_http_marker() {
        // 메서드 토큰이 있어도 HTTP/ 가 없으면 태그를 붙이지 않습니다.
        let alert = Alert::new(tcp_threat(b"GET lost", ThreatLevel::Level2));
        assert_eq!(
            alert.display(),
            format!("203.0.113.5:1234,TCP,LEVEL_2,{}", hex_string(b"GET lost")),
        );
    }

    #[test]
    fn display_truncates_long_samples() {
        let mut sample = b"GET / HTTP/1.1\r\n".to_vec();
        sample.extend(std::iter::repeat(b'A').take(4096));
        let mut t = Threat::new(
            Protocol::Tcp,
            "203.0.113.5".parse().unwrap(),
            1234,
            Bytes::from(sample),
        );
        t.set_level(ThreatLevel::Level2);

        let display = Alert::new(t).display();
        // 접두사 + "HTTP_GET " 태그 + 1536바이트의 hex
        let hex_len = MAX_DISPLAY_SAMPLE_BYTES * 2;
        assert!(display.ends_with("41414141"));
        assert_eq!(
            display.len(),
            "203.0.113.5:1234,TCP,LEVEL_2,HTTP_GET ".len() + hex_len,
        );
    }

    #[test]
    fn display_ipv6_address() {
        let mut t = Threat::new(
            Protocol::Tcp,
            "2001:db8::1".parse().unwrap(),
            443,
            Bytes::new(),
        );
        t.set_level(ThreatLevel::Level1);
        assert_eq!(Alert::new(t).display(), "2001:db8::1:443,TCP,LEVEL_1,");
    }

    #[test]
    fn level_and_protocol_serialize_roundtrip() {
        let level = ThreatLevel::Level3;
        let json = serde_json::to_string(&level).unwrap();
        let back: ThreatLevel = serde_json::from_str(&json).unwrap();
        assert_eq!(level, back);

        let proto = Protocol::Icmp;
        let json = serde_json::to_string(&proto).unwrap();
        let back: Protocol = serde_json::from_str(&json).unwrap();
        assert_eq!(proto, back);
    }

    #[test]
    fn hex_string_lowercase_no_separator() {
        assert_eq!(hex_string(b"hello"), "68656c6c6f");
        assert_eq!(hex_string(&[0x00, 0xff, 0x0a]), "00ff0a");
        assert_eq!(hex_string(b""), "");
    }

    #[test]
    fn contains_subsequence() {
        assert!(contains(b"abcFOOdef", b"FOO"));
        assert!(!contains(b"abcdef", b"FOO"));
        assert!(!contains(b"FO", b"FOO"));
        assert!(!contains(b"abc", b""));
    }
}
