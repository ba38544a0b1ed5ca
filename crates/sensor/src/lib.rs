#![doc = include_str!("../README.md")]

pub mod acceptor;
pub mod error;
pub mod icmp;
pub mod packet;
pub mod socket;
pub mod tcp;
pub mod transport;
pub mod udp;

// --- 주요 타입 re-export ---

pub use acceptor::{AcceptorState, TcpAcceptor};
pub use error::TransportError;
pub use icmp::IcmpReceiver;
pub use packet::{IcmpDatagram, IcmpHeader, IcmpMessageType, Ipv4Header};
pub use tcp::TcpSensor;
pub use transport::{
    AcceptedConnection, TcpTransport, TransportMetrics, TransportOptions, TransportState,
};
pub use udp::{UdpListener, UdpSensor};
