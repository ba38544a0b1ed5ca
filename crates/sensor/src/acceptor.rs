//! TCP 수락기 — 한 포트의 듀얼스택(v4+v6) 리스너
//!
//! 패밀리별 수락 루프가 독립적으로 돌며, 수락된 연결은 `on_accept` 콜백이
//! 구성을 마친 트랜스포트로 레지스트리에 등록됩니다. 1초 주기의 수확
//! 타이머가 종결된 트랜스포트를 레지스트리에서 제거합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use opensentinel_core::error::NetError;

use crate::socket::{bind_tcp_listener, Family};
use crate::transport::{AcceptedConnection, TcpTransport};

/// 수락된 트랜스포트 레지스트리 수확 주기
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// 수락 직후 연결을 구성하는 콜백
///
/// 타임아웃과 읽기 핸들러를 설정한 뒤 `start()`한 핸들을 반환하면
/// 수락기가 레지스트리에 등록합니다. `None`을 반환하면 연결은 버려집니다.
pub type OnAccept = dyn Fn(AcceptedConnection) -> Option<TcpTransport> + Send + Sync;

/// 수락기/리스너 상태 — 전이는 단조입니다.
/// `Stopped` 이후 `Started`로 재진입하지 않습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptorState {
    /// 초기 상태
    None = 0,
    /// 소켓 바인드 중
    Starting = 1,
    /// 수락 루프 동작 중
    Started = 2,
    /// 종료 진행 중
    Stopping = 3,
    /// 종료 완료
    Stopped = 4,
}

impl AcceptorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::None,
        }
    }
}

/// 한 포트의 듀얼스택 TCP 수락기
#[derive(Debug)]
pub struct TcpAcceptor {
    port: u16,
    state: Arc<AtomicU8>,
    registry: Arc<Mutex<HashMap<u64, TcpTransport>>>,
    cancel: CancellationToken,
}

impl TcpAcceptor {
    /// 포트에 v4/v6 리스너를 바인드하고 수락을 시작합니다.
    ///
    /// v4가 포트 0으로 바인드되면 v6는 v4가 실제로 받은 포트를 따릅니다.
    /// v4 성공 후 v6가 실패하면 두 소켓 모두 닫고 에러를 반환합니다.
    pub fn open(port: u16, on_accept: Arc<OnAccept>) -> Result<Self, NetError> {
        let state = Arc::new(AtomicU8::new(AcceptorState::Starting as u8));

        debug!(port, "TCP acceptor is opening");

        let v4 = bind_tcp_listener(port, Family::V4)?;
        let bound_port = v4
            .local_addr()
            .map_err(|e| NetError::BindFailed {
                port,
                family: Family::V4.name(),
                reason: e.to_string(),
            })?
            .port();

        let v6 = match bind_tcp_listener(bound_port, Family::V6) {
            Ok(listener) => listener,
            Err(err) => {
                // v4는 drop으로 닫힙니다.
                error!(port = bound_port, error = %err, "ipv6 bind failed");
                return Err(err);
            }
        };

        let registry = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            v4,
            Family::V4,
            Arc::clone(&registry),
            Arc::clone(&on_accept),
            cancel.clone(),
        ));
        tokio::spawn(accept_loop(
            v6,
            Family::V6,
            Arc::clone(&registry),
            on_accept,
            cancel.clone(),
        ));
        tokio::spawn(reap_loop(Arc::clone(&registry), cancel.clone()));

        state.store(AcceptorState::Started as u8, Ordering::Release);

        Ok(Self {
            port: bound_port,
            state,
            registry,
            cancel,
        })
    }

    /// 바인드된 포트
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 현재 상태
    pub fn state(&self) -> AcceptorState {
        AcceptorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 레지스트리에 남아 있는 트랜스포트 수 (수확 전 종결분 포함)
    pub fn transport_count(&self) -> usize {
        self.registry.lock().expect("registry poisoned").len()
    }

    /// 레지스트리에서 아직 연결이 살아 있는 트랜스포트 수
    pub fn live_transport_count(&self) -> usize {
        self.registry
            .lock()
            .expect("registry poisoned")
            .values()
            .filter(|t| !t.is_stopped())
            .count()
    }

    /// 수락기를 닫고 모든 트랜스포트를 종결합니다. 멱등합니다.
    pub fn close(&self) {
        let prev = self.state.swap(AcceptorState::Stopping as u8, Ordering::AcqRel);
        if prev >= AcceptorState::Stopping as u8 {
            self.state.store(prev, Ordering::Release);
            return;
        }

        let transports: Vec<TcpTransport> = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.drain().map(|(_, t)| t).collect()
        };

        info!(
            port = self.port,
            transports = transports.len(),
            "TCP acceptor is stopping"
        );

        self.cancel.cancel();
        for transport in &transports {
            transport.stop();
        }

        self.state
            .store(AcceptorState::Stopped as u8, Ordering::Release);
        debug!(port = self.port, "TCP acceptor has stopped");
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    family: Family,
    registry: Arc<Mutex<HashMap<u64, TcpTransport>>>,
    on_accept: Arc<OnAccept>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(family = family.name(), peer = %peer, "accepting tcp connection");
                        let conn = AcceptedConnection::new(stream, peer);
                        match on_accept(conn) {
                            Some(transport) => {
                                registry
                                    .lock()
                                    .expect("registry poisoned")
                                    .insert(transport.id(), transport);
                            }
                            None => {
                                debug!(peer = %peer, "dropping tcp connection, no handler");
                            }
                        }
                    }
                    Err(err) => {
                        error!(family = family.name(), error = %err, "tcp accept failed");
                        // fd 고갈 등으로 accept가 연속 실패할 때의 busy-loop 방지
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

async fn reap_loop(registry: Arc<Mutex<HashMap<u64, TcpTransport>>>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(REAP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                registry
                    .lock()
                    .expect("registry poisoned")
                    .retain(|_, transport| !transport.is_stopped());
            }
        }
    }
}
