//! UDP 리스너와 센서 매니저
//!
//! [`UdpListener`]는 한 포트의 듀얼스택 데이터그램 수신기입니다. 패밀리별
//! 수신 태스크가 65,535바이트 버퍼 하나를 재사용하며, 콜백에는 유효 바이트
//! 슬라이스만 전달됩니다(콜백 밖으로 보존 불가 — 필요하면 복사).
//! [`UdpSensor`]는 포트 범위 전체에 리스너를 배치하고 데이터그램마다
//! L3 위협을 발행합니다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use opensentinel_core::config::UdpConfig;
use opensentinel_core::error::{NetError, PipelineError, SentinelError};
use opensentinel_core::event::{ThreatEvent, MODULE_UDP_SENSOR};
use opensentinel_core::pipeline::{HealthStatus, Pipeline};
use opensentinel_core::types::{Protocol, Threat, ThreatLevel};

use crate::acceptor::AcceptorState;
use crate::socket::{bind_udp_socket, Family};

/// 한 데이터그램의 최대 길이 — 이보다 크거나 길이 0이면 버립니다.
pub const MAX_DATAGRAM_BYTES: usize = 65_535;

/// 종료된 리스너 수확 주기
const SWEEP_INTERVAL: Duration = Duration::from_secs(8);

/// 데이터그램 수신 콜백
pub type OnDatagram = dyn Fn(SocketAddr, &[u8]) + Send + Sync;

type SocketSlot = Arc<AsyncMutex<Arc<UdpSocket>>>;

/// 한 포트의 듀얼스택 UDP 리스너
pub struct UdpListener {
    port: u16,
    state: Arc<AtomicU8>,
    v4: SocketSlot,
    v6: SocketSlot,
    cancel: CancellationToken,
}

impl UdpListener {
    /// 포트에 v4/v6 소켓을 바인드하고 수신을 시작합니다.
    pub fn open(port: u16, on_datagram: Arc<OnDatagram>) -> Result<Self, NetError> {
        let state = Arc::new(AtomicU8::new(AcceptorState::Starting as u8));

        let v4_socket = bind_udp_socket(port, Family::V4)?;
        let bound_port = v4_socket
            .local_addr()
            .map_err(|e| NetError::BindFailed {
                port,
                family: Family::V4.name(),
                reason: e.to_string(),
            })?
            .port();
        let v6_socket = bind_udp_socket(bound_port, Family::V6)?;

        debug!(port = bound_port, "UDP listener bound both families");

        let v4: SocketSlot = Arc::new(AsyncMutex::new(Arc::new(v4_socket)));
        let v6: SocketSlot = Arc::new(AsyncMutex::new(Arc::new(v6_socket)));
        let cancel = CancellationToken::new();

        tokio::spawn(recv_loop(
            Arc::clone(&v4),
            Family::V4,
            Arc::clone(&on_datagram),
            cancel.clone(),
        ));
        tokio::spawn(recv_loop(
            Arc::clone(&v6),
            Family::V6,
            on_datagram,
            cancel.clone(),
        ));

        state.store(AcceptorState::Started as u8, Ordering::Release);

        Ok(Self {
            port: bound_port,
            state,
            v4,
            v6,
            cancel,
        })
    }

    /// 바인드된 포트
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 현재 상태
    pub fn state(&self) -> AcceptorState {
        match self.state.load(Ordering::Acquire) {
            1 => AcceptorState::Starting,
            2 => AcceptorState::Started,
            3 => AcceptorState::Stopping,
            4 => AcceptorState::Stopped,
            _ => AcceptorState::None,
        }
    }

    /// 데이터그램을 보냅니다.
    ///
    /// 길이 0이거나 [`MAX_DATAGRAM_BYTES`]를 넘는 패킷은 보내지 않습니다.
    /// broken pipe가 나면 해당 패밀리 소켓을 닫고 다시 열어 한 번
    /// 재전송합니다.
    pub async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<(), NetError> {
        if data.is_empty() || data.len() > MAX_DATAGRAM_BYTES {
            return Ok(());
        }

        let (slot, family) = if target.is_ipv4() {
            (&self.v4, Family::V4)
        } else {
            (&self.v6, Family::V6)
        };

        let mut guard = slot.lock().await;
        match guard.send_to(data, target).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(family = family.name(), error = %err, "UDP send failed, reopening socket");
                let fresh = bind_udp_socket(self.port, family)?;
                *guard = Arc::new(fresh);
                // 재전송은 한 번만 시도하고 결과는 무시합니다.
                let _ = guard.send_to(data, target).await;
                Ok(())
            }
            Err(err) => Err(NetError::WriteError(err.to_string())),
        }
    }

    /// 리스너를 닫습니다. 멱등합니다.
    pub fn close(&self) {
        let prev = self
            .state
            .swap(AcceptorState::Stopping as u8, Ordering::AcqRel);
        if prev >= AcceptorState::Stopping as u8 {
            self.state.store(prev, Ordering::Release);
            return;
        }
        self.cancel.cancel();
        self.state
            .store(AcceptorState::Stopped as u8, Ordering::Release);
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// 패밀리별 수신 루프 — 버퍼 하나를 모든 수신에 재사용합니다.
async fn recv_loop(
    slot: SocketSlot,
    family: Family,
    on_datagram: Arc<OnDatagram>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];

    loop {
        // send_to가 소켓을 교체했을 수 있으므로 반복마다 현재 소켓을 집습니다.
        let socket = { slot.lock().await.clone() };

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        if len == 0 {
                            debug!(family = family.name(), peer = %peer, "dropping empty datagram");
                            continue;
                        }
                        on_datagram(peer, &buf[..len]);
                    }
                    Err(err) => {
                        debug!(family = family.name(), error = %err, "UDP receive failed, re-arming");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }
}

/// UDP 센서 매니저
pub struct UdpSensor {
    config: UdpConfig,
    threat_tx: mpsc::Sender<ThreatEvent>,
    listeners: Arc<std::sync::Mutex<Vec<UdpListener>>>,
    cancel: CancellationToken,
    state: UdpSensorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UdpSensorState {
    Initialized,
    Running,
    Stopped,
}

impl UdpSensor {
    /// 새 UDP 센서를 생성합니다.
    pub fn new(config: UdpConfig, threat_tx: mpsc::Sender<ThreatEvent>) -> Self {
        Self {
            config,
            threat_tx,
            listeners: Arc::new(std::sync::Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            state: UdpSensorState::Initialized,
        }
    }

    /// 현재 열려 있는 리스너 수
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("listeners poisoned").len()
    }

    fn make_on_datagram(&self) -> Arc<OnDatagram> {
        let threat_tx = self.threat_tx.clone();
        Arc::new(move |peer: SocketAddr, data: &[u8]| {
            info!(
                peer = %peer,
                bytes = data.len(),
                "UDP sensor detected a possible threat (UDP receive), dispatching"
            );

            let mut threat = Threat::new(
                Protocol::Udp,
                peer.ip(),
                peer.port(),
                Bytes::copy_from_slice(data),
            );
            threat.set_level(ThreatLevel::Level3);

            let event = ThreatEvent::new(MODULE_UDP_SENSOR, threat);
            if let Err(err) = threat_tx.try_send(event) {
                warn!(error = %err, "threat channel full, dropping observation");
            }
        })
    }
}

impl Pipeline for UdpSensor {
    async fn start(&mut self) -> Result<(), SentinelError> {
        if self.state == UdpSensorState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!("UDP sensor is starting...");

        let on_datagram = self.make_on_datagram();
        let mut opened = 0;

        'walk: for (begin, end) in &self.config.port_ranges {
            for port in *begin..=*end {
                match UdpListener::open(port, Arc::clone(&on_datagram)) {
                    Ok(listener) => {
                        self.listeners
                            .lock()
                            .expect("listeners poisoned")
                            .push(listener);
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
                        error!(port, error = %err, "failed to open listener, skipping");
                    }
                }
            }
        }

        self.cancel = CancellationToken::new();
        let listeners = Arc::clone(&self.listeners);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        listeners
                            .lock()
                            .expect("listeners poisoned")
                            .retain(|l| l.state() != AcceptorState::Stopped);
                    }
                }
            }
        });

        self.state = UdpSensorState::Running;
        info!(listeners = opened, "UDP sensor has started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SentinelError> {
        info!("UDP sensor is stopping...");

        self.cancel.cancel();

        let listeners: Vec<UdpListener> = {
            let mut guard = self.listeners.lock().expect("listeners poisoned");
            guard.drain(..).collect()
        };
        info!(listeners = listeners.len(), "UDP sensor is closing listeners");
        for listener in &listeners {
            listener.close();
        }

        self.state = UdpSensorState::Stopped;
        info!("UDP sensor has stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            UdpSensorState::Running => {
                if self.listener_count() == 0 {
                    HealthStatus::Degraded("no listeners open".to_owned())
                } else {
                    HealthStatus::Healthy
                }
            }
            UdpSensorState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            UdpSensorState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_datagram() -> Arc<OnDatagram> {
        Arc::new(|_peer: SocketAddr, _data: &[u8]| {})
    }

    #[tokio::test]
    async fn listener_receives_v4_and_v6_datagrams() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let listener = UdpListener::open(
            0,
            Arc::new(move |peer: SocketAddr, data: &[u8]| {
                let _ = seen_tx.send((peer, data.to_vec()));
            }),
        )
        .unwrap();
        let port = listener.port();

        let v4_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        v4_client.send_to(b"ping4", ("127.0.0.1", port)).await.unwrap();
        let (_, data) = seen_rx.recv().await.unwrap();
        assert_eq!(data, b"ping4");

        let v6_client = UdpSocket::bind("[::1]:0").await.unwrap();
        v6_client.send_to(b"ping6", ("::1", port)).await.unwrap();
        let (_, data) = seen_rx.recv().await.unwrap();
        assert_eq!(data, b"ping6");
    }

    #[tokio::test]
    async fn listener_send_to_reaches_target() {
        let listener = UdpListener::open(0, noop_datagram()).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = client.local_addr().unwrap();

        listener.send_to(target, b"reply").await.unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"reply");
    }

    #[tokio::test]
    async fn send_to_ignores_empty_and_oversized() {
        let listener = UdpListener::open(0, noop_datagram()).unwrap();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        listener.send_to(target, b"").await.unwrap();
        let big = vec![0u8; MAX_DATAGRAM_BYTES + 1];
        listener.send_to(target, &big).await.unwrap();
    }

    #[tokio::test]
    async fn listener_close_is_idempotent() {
        let listener = UdpListener::open(0, noop_datagram()).unwrap();
        listener.close();
        assert_eq!(listener.state(), AcceptorState::Stopped);
        listener.close();
        assert_eq!(listener.state(), AcceptorState::Stopped);
    }

    fn test_config(ranges: Vec<(u16, u16)>) -> UdpConfig {
        UdpConfig {
            enabled: true,
            port_ranges: ranges,
        }
    }

    const BASE: u16 = 43200;

    #[tokio::test]
    async fn sensor_emits_level3_threat_per_datagram() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sensor = UdpSensor::new(test_config(vec![(BASE, BASE)]), tx);
        sensor.start().await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", ("127.0.0.1", BASE)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.threat.protocol(), Protocol::Udp);
        assert_eq!(event.threat.level(), ThreatLevel::Level3);
        assert_eq!(event.threat.buffer().as_ref(), b"hello");
        assert_eq!(event.metadata.source_module, "udp-sensor");

        sensor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sensor_opens_range_and_stops_cleanly() {
        let (tx, _rx) = mpsc::channel(64);
        let mut sensor = UdpSensor::new(test_config(vec![(BASE + 10, BASE + 13)]), tx);

        sensor.start().await.unwrap();
        assert_eq!(sensor.listener_count(), 4);
        assert!(sensor.health_check().await.is_healthy());

        sensor.stop().await.unwrap();
        assert_eq!(sensor.listener_count(), 0);

        // 같은 범위를 다시 열 수 있어야 합니다 (소켓이 실제로 닫혔는지 확인).
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (tx2, _rx2) = mpsc::channel(64);
        let mut second = UdpSensor::new(test_config(vec![(BASE + 10, BASE + 13)]), tx2);
        second.start().await.unwrap();
        assert_eq!(second.listener_count(), 4);
        second.stop().await.unwrap();
    }
}
