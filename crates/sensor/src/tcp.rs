//! TCP 센서 — 포트 범위 전체에 수락기를 배치하는 매니저
//!
//! 설정된 범위의 포트마다 [`TcpAcceptor`]를 열고, 수락된 연결에
//! 위협 핸들러를 설치합니다:
//! 1. 수락 시점 — 샘플 없는 위협 (L0)
//! 2. 첫 읽기 — 읽은 바이트를 샘플로 담은 위협 (L0)
//!
//! 공격자가 소켓을 무한정 잡아두지 못하도록 모든 수락 연결에 읽기/쓰기
//! 타임아웃을 겁니다. 8초 주기의 수확 타이머가 종료된 수락기를 정리합니다.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use opensentinel_core::config::TcpConfig;
use opensentinel_core::error::{NetError, PipelineError, SentinelError};
use opensentinel_core::event::{ThreatEvent, MODULE_TCP_SENSOR};
use opensentinel_core::pipeline::{HealthStatus, Pipeline};
use opensentinel_core::types::{Protocol, Threat};

use crate::acceptor::{AcceptorState, OnAccept, TcpAcceptor};
use crate::transport::AcceptedConnection;

/// 종료된 수락기 수확 주기
const SWEEP_INTERVAL: Duration = Duration::from_secs(8);

/// 센서 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorState {
    Initialized,
    Running,
    Stopped,
}

/// TCP 센서 매니저
pub struct TcpSensor {
    config: TcpConfig,
    threat_tx: mpsc::Sender<ThreatEvent>,
    acceptors: Arc<Mutex<Vec<TcpAcceptor>>>,
    cancel: CancellationToken,
    state: SensorState,
}

impl TcpSensor {
    /// 새 TCP 센서를 생성합니다. `start` 전에는 아무 포트도 열지 않습니다.
    pub fn new(config: TcpConfig, threat_tx: mpsc::Sender<ThreatEvent>) -> Self {
        Self {
            config,
            threat_tx,
            acceptors: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            state: SensorState::Initialized,
        }
    }

    /// 현재 열려 있는 수락기 수
    pub fn acceptor_count(&self) -> usize {
        self.acceptors.lock().expect("acceptors poisoned").len()
    }

    /// 수락 핸들러 — 모든 수락기가 공유합니다.
    fn make_on_accept(&self) -> Arc<OnAccept> {
        let threat_tx = self.threat_tx.clone();
        let read_timeout = nonzero_secs(self.config.read_timeout_secs);
        let write_timeout = nonzero_secs(self.config.write_timeout_secs);

        Arc::new(move |mut conn: AcceptedConnection| {
            let peer = conn.peer_addr();

            info!(
                peer = %peer,
                "TCP sensor detected a possible threat (TCP accept), dispatching"
            );
            send_threat(
                &threat_tx,
                Threat::without_sample(Protocol::Tcp, peer.ip(), peer.port()),
            );

            let tx = threat_tx.clone();
            let mut sampled = false;
            conn.set_on_read(move |data| {
                // 첫 읽기만 샘플 위협으로 보고합니다.
                if sampled {
                    return;
                }
                sampled = true;

                info!(
                    peer = %peer,
                    bytes = data.len(),
                    "TCP sensor detected a possible threat (TCP read), dispatching"
                );
                send_threat(
                    &tx,
                    Threat::new(
                        Protocol::Tcp,
                        peer.ip(),
                        peer.port(),
                        Bytes::copy_from_slice(data),
                    ),
                );
            });

            conn.set_read_timeout(read_timeout);
            conn.set_write_timeout(write_timeout);

            Some(conn.start())
        })
    }
}

impl Pipeline for TcpSensor {
    async fn start(&mut self) -> Result<(), SentinelError> {
        if self.state == SensorState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!("TCP sensor is starting...");

        let on_accept = self.make_on_accept();
        let opened = open_port_ranges(&self.config.port_ranges, &on_accept, &self.acceptors);

        self.cancel = CancellationToken::new();
        tokio::spawn(sweep_loop(Arc::clone(&self.acceptors), self.cancel.clone()));

        self.state = SensorState::Running;
        info!(acceptors = opened, "TCP sensor has started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SentinelError> {
        info!("TCP sensor is stopping...");

        self.cancel.cancel();

        let acceptors: Vec<TcpAcceptor> = {
            let mut guard = self.acceptors.lock().expect("acceptors poisoned");
            guard.drain(..).collect()
        };
        info!(acceptors = acceptors.len(), "TCP sensor is closing acceptors");
        for acceptor in &acceptors {
            acceptor.close();
        }

        self.state = SensorState::Stopped;
        info!("TCP sensor has stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            SensorState::Running => {
                if self.acceptor_count() == 0 {
                    HealthStatus::Degraded("no acceptors open".to_owned())
                } else {
                    HealthStatus::Healthy
                }
            }
            SensorState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            SensorState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 포트 범위를 순회하며 수락기를 엽니다.
///
/// 포트 단위 실패는 건너뛰고, fd 고갈은 남은 순회 전체를 중단합니다.
fn open_port_ranges(
    ranges: &[(u16, u16)],
    on_accept: &Arc<OnAccept>,
    acceptors: &Arc<Mutex<Vec<TcpAcceptor>>>,
) -> usize {
    let mut opened = 0;

    'walk: for (begin, end) in ranges {
        for port in *begin..=*end {
            match TcpAcceptor::open(port, Arc::clone(on_accept)) {
                Ok(acceptor) => {
                    acceptors
                        .lock()
                        .expect("acceptors poisoned")
                        .push(acceptor);
                    opened += 1;
                }
                Err(NetError::FdExhausted) => {
                    error!(port, "file descriptors exhausted, aborting port walk");
                    break 'walk;
                }
                Err(NetError::AddrInUse { .. }) => {
                    warn!(port, "port in use, skipping");
                }
                Err(err) => {
                    error!(port, error = %err, "failed to open acceptor, skipping");
                }
            }
        }
    }

    opened
}

async fn sweep_loop(acceptors: Arc<Mutex<Vec<TcpAcceptor>>>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                acceptors
                    .lock()
                    .expect("acceptors poisoned")
                    .retain(|a| a.state() != AcceptorState::Stopped);
            }
        }
    }
}

fn send_threat(tx: &mpsc::Sender<ThreatEvent>, threat: Threat) {
    let event = ThreatEvent::new(MODULE_TCP_SENSOR, threat);
    if let Err(err) = tx.try_send(event) {
        warn!(error = %err, "threat channel full, dropping observation");
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn test_config(ranges: Vec<(u16, u16)>) -> TcpConfig {
        TcpConfig {
            enabled: true,
            port_ranges: ranges,
            read_timeout_secs: 5,
            write_timeout_secs: 5,
        }
    }

    // 테스트는 권한 없이 바인드되는 높은 포트 범위를 사용합니다.
    const BASE: u16 = 42100;

    #[tokio::test]
    async fn start_opens_configured_range() {
        let (tx, _rx) = mpsc::channel(64);
        let mut sensor = TcpSensor::new(test_config(vec![(BASE, BASE + 4)]), tx);

        sensor.start().await.unwrap();
        assert_eq!(sensor.acceptor_count(), 5);
        assert!(sensor.health_check().await.is_healthy());

        sensor.stop().await.unwrap();
        assert_eq!(sensor.acceptor_count(), 0);
        assert!(sensor.health_check().await.is_unhealthy());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (tx, _rx) = mpsc::channel(64);
        let mut sensor = TcpSensor::new(test_config(vec![(BASE + 10, BASE + 10)]), tx);

        sensor.start().await.unwrap();
        assert!(sensor.start().await.is_err());
        sensor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn accept_emits_empty_threat_at_level_zero() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sensor = TcpSensor::new(test_config(vec![(BASE + 20, BASE + 20)]), tx);
        sensor.start().await.unwrap();

        let _client = TcpStream::connect(("127.0.0.1", BASE + 20)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.threat.protocol(), Protocol::Tcp);
        assert!(!event.threat.has_payload());
        assert_eq!(event.threat.level(), opensentinel_core::ThreatLevel::Level0);
        assert_eq!(event.metadata.source_module, "tcp-sensor");

        sensor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn only_first_read_emits_sampled_threat() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sensor = TcpSensor::new(test_config(vec![(BASE + 30, BASE + 30)]), tx);
        sensor.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", BASE + 30)).await.unwrap();

        // accept 위협
        let accept_event = rx.recv().await.unwrap();
        assert!(!accept_event.threat.has_payload());

        client.write_all(b"FOO").await.unwrap();
        client.flush().await.unwrap();
        let read_event = rx.recv().await.unwrap();
        assert_eq!(read_event.threat.buffer().as_ref(), b"FOO");

        // 두 번째 쓰기는 새 위협을 만들지 않습니다.
        client.write_all(b"BAR").await.unwrap();
        client.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        sensor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn busy_port_is_skipped() {
        // 범위 중간 포트를 먼저 점유합니다.
        let holder = tokio::net::TcpListener::bind(("0.0.0.0", BASE + 41))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(64);
        let mut sensor = TcpSensor::new(test_config(vec![(BASE + 40, BASE + 42)]), tx);
        sensor.start().await.unwrap();

        // 점유된 포트 하나만 빠집니다.
        assert_eq!(sensor.acceptor_count(), 2);

        drop(holder);
        sensor.stop().await.unwrap();
    }
}
