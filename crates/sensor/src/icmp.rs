//! ICMP 수신기 — raw ICMPv4 소켓 스니퍼
//!
//! raw 소켓은 상승된 권한이 필요합니다. 열기에 실패하면 `start`가 에러를
//! 반환하고, 스택은 이를 비치명으로 처리해 ICMP 없이 계속 동작합니다.
//!
//! 수신한 모든 데이터그램을 `IPv4 헤더 | ICMP 헤더`로 파싱하고,
//! echo request/reply면 L3 위협(포트 0, 샘플 없음)을 발행합니다.
//! 파싱 실패는 해당 데이터그램만 버리고 수신을 다시 겁니다.

use std::mem::MaybeUninit;
use std::net::IpAddr;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opensentinel_core::error::{PipelineError, SentinelError};
use opensentinel_core::event::{ThreatEvent, MODULE_ICMP_SENSOR};
use opensentinel_core::pipeline::{HealthStatus, Pipeline};
use opensentinel_core::types::{Protocol, Threat, ThreatLevel};

use crate::packet::parse_icmp_datagram;
use crate::socket::open_raw_icmp_v4;

/// 수신 버퍼 크기
const RECV_BUFFER_BYTES: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    Initialized,
    Running,
    Stopped,
}

/// raw ICMPv4 수신기
pub struct IcmpReceiver {
    threat_tx: mpsc::Sender<ThreatEvent>,
    cancel: CancellationToken,
    state: ReceiverState,
}

impl IcmpReceiver {
    /// 새 ICMP 수신기를 생성합니다. `start` 전에는 소켓을 열지 않습니다.
    pub fn new(threat_tx: mpsc::Sender<ThreatEvent>) -> Self {
        Self {
            threat_tx,
            cancel: CancellationToken::new(),
            state: ReceiverState::Initialized,
        }
    }
}

impl Pipeline for IcmpReceiver {
    async fn start(&mut self) -> Result<(), SentinelError> {
        if self.state == ReceiverState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!("ICMP receiver is starting...");

        // 권한이 없으면 여기서 실패하고, 스택이 비치명으로 처리합니다.
        let socket = open_raw_icmp_v4()?;
        let async_fd = AsyncFd::new(socket)?;

        self.cancel = CancellationToken::new();
        tokio::spawn(recv_loop(
            async_fd,
            self.threat_tx.clone(),
            self.cancel.clone(),
        ));

        self.state = ReceiverState::Running;
        info!("ICMP receiver has started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SentinelError> {
        info!("ICMP receiver is stopping...");
        self.cancel.cancel();
        self.state = ReceiverState::Stopped;
        info!("ICMP receiver has stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ReceiverState::Running => HealthStatus::Healthy,
            ReceiverState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ReceiverState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

async fn recv_loop(
    async_fd: AsyncFd<socket2::Socket>,
    threat_tx: mpsc::Sender<ThreatEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_BYTES];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            guard = async_fd.readable() => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(err) => {
                        warn!(error = %err, "ICMP socket poll failed, stopping receiver");
                        break;
                    }
                };

                let result = guard.try_io(|inner| {
                    // 버퍼는 이미 초기화되어 있으므로 MaybeUninit 뷰는 안전합니다.
                    let uninit = unsafe {
                        &mut *(buf.as_mut_slice() as *mut [u8] as *mut [MaybeUninit<u8>])
                    };
                    inner.get_ref().recv(uninit)
                });

                match result {
                    Ok(Ok(len)) => handle_datagram(&buf[..len], &threat_tx),
                    Ok(Err(err)) => {
                        debug!(error = %err, "ICMP receive failed, re-arming");
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

/// 데이터그램 하나를 파싱하고, echo request/reply면 위협을 발행합니다.
fn handle_datagram(buf: &[u8], threat_tx: &mpsc::Sender<ThreatEvent>) {
    let datagram = match parse_icmp_datagram(buf) {
        Ok(datagram) => datagram,
        Err(err) => {
            debug!(error = %err, bytes = buf.len(), "dropping unparseable ICMP datagram");
            return;
        }
    };

    let source = datagram.ipv4.source_address();
    debug!(
        source = %source,
        seq = datagram.icmp.sequence_number(),
        ttl = datagram.ipv4.time_to_live(),
        code = datagram.icmp.code(),
        icmp_type = ?datagram.icmp.message_type(),
        bytes = buf.len() - datagram.ipv4.header_length(),
        "ICMP receiver got datagram"
    );

    // PING을 위협으로 간주합니다.
    if !datagram.icmp.message_type().is_echo() {
        return;
    }

    let mut threat = Threat::without_sample(Protocol::Icmp, IpAddr::V4(source), 0);
    threat.set_level(ThreatLevel::Level3);

    info!(
        source = %source,
        "ICMP receiver detected a possible threat (ICMP receive), dispatching"
    );

    let event = ThreatEvent::new(MODULE_ICMP_SENSOR, threat);
    if let Err(err) = threat_tx.try_send(event) {
        warn!(error = %err, "threat channel full, dropping observation");
    }
}
