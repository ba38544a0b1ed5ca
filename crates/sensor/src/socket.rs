//! 듀얼스택 소켓 헬퍼
//!
//! tokio가 직접 노출하지 않는 소켓 옵션(`SO_REUSEADDR`, `IPV6_V6ONLY`,
//! raw ICMP)을 `socket2`로 설정한 뒤 tokio 타입으로 변환합니다.
//! v6 소켓은 v6-only로 묶어 같은 포트에 v4/v6 소켓이 나란히 바인드됩니다.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};

use opensentinel_core::error::NetError;

/// 소켓 패밀리 구분 (로그와 에러 메시지에 사용)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4 (`0.0.0.0`)
    V4,
    /// IPv6 (`[::]`, v6-only)
    V6,
}

impl Family {
    /// 에러 메시지용 이름
    pub fn name(self) -> &'static str {
        match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        }
    }

    fn domain(self) -> Domain {
        match self {
            Self::V4 => Domain::IPV4,
            Self::V6 => Domain::IPV6,
        }
    }

    fn any_addr(self, port: u16) -> SocketAddr {
        match self {
            Self::V4 => (Ipv4Addr::UNSPECIFIED, port).into(),
            Self::V6 => (Ipv6Addr::UNSPECIFIED, port).into(),
        }
    }
}

/// I/O 에러를 포트 순회 정책이 구분하는 [`NetError`]로 변환합니다.
///
/// `EADDRINUSE`는 해당 포트만 건너뛰고, `EMFILE`/`ENFILE`은 범위 순회를
/// 중단시킵니다.
pub fn classify_bind_error(port: u16, family: Family, err: io::Error) -> NetError {
    if err.kind() == io::ErrorKind::AddrInUse {
        return NetError::AddrInUse { port };
    }
    match err.raw_os_error() {
        Some(code) if code == libc::EMFILE || code == libc::ENFILE => NetError::FdExhausted,
        _ => NetError::BindFailed {
            port,
            family: family.name(),
            reason: err.to_string(),
        },
    }
}

fn socket_open_error(family: Family, err: io::Error) -> NetError {
    match err.raw_os_error() {
        Some(code) if code == libc::EMFILE || code == libc::ENFILE => NetError::FdExhausted,
        _ => NetError::SocketOpenFailed {
            family: family.name(),
            reason: err.to_string(),
        },
    }
}

/// 한 패밀리의 TCP 리스너를 `SO_REUSEADDR`로 바인드합니다.
pub fn bind_tcp_listener(port: u16, family: Family) -> Result<tokio::net::TcpListener, NetError> {
    let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| socket_open_error(family, e))?;

    prepare(&socket, family).map_err(|e| classify_bind_error(port, family, e))?;

    socket
        .bind(&family.any_addr(port).into())
        .map_err(|e| classify_bind_error(port, family, e))?;
    socket
        .listen(1024)
        .map_err(|e| classify_bind_error(port, family, e))?;

    let std_listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(std_listener)
        .map_err(|e| classify_bind_error(port, family, e))
}

/// 한 패밀리의 UDP 소켓을 논블로킹으로 바인드합니다.
pub fn bind_udp_socket(port: u16, family: Family) -> Result<tokio::net::UdpSocket, NetError> {
    let socket = Socket::new(family.domain(), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| socket_open_error(family, e))?;

    prepare(&socket, family).map_err(|e| classify_bind_error(port, family, e))?;

    socket
        .bind(&family.any_addr(port).into())
        .map_err(|e| classify_bind_error(port, family, e))?;

    let std_socket: std::net::UdpSocket = socket.into();
    tokio::net::UdpSocket::from_std(std_socket).map_err(|e| classify_bind_error(port, family, e))
}

/// raw ICMPv4 소켓을 엽니다. 일반적으로 상승된 권한이 필요합니다.
pub fn open_raw_icmp_v4() -> Result<Socket, NetError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(|e| socket_open_error(Family::V4, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| socket_open_error(Family::V4, e))?;
    Ok(socket)
}

fn prepare(socket: &Socket, family: Family) -> io::Result<()> {
    socket.set_reuse_address(true)?;
    if family == Family::V6 {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)
}
