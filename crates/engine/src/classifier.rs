//! 위협 분류기 — 원시 관측에 심각도를 부여합니다
//!
//! 분류기 태스크는 위협 채널의 단독 소비자입니다. 순서대로(FIFO) 이벤트를
//! 받아 심각도를 갱신하고, L0을 넘는 위협만 디스패처 채널로 넘깁니다.
//!
//! 분류 규칙 (순서대로):
//! 1. 샘플이 비어 있고 현재 심각도가 L0이면 → L1
//! 2. 샘플에 적대 지문이 보이면 → L3
//! 3. 샘플이 비어 있지 않으면 → L2
//! 4. 상류에서 부여된 더 높은 심각도는 항상 보존됩니다
//!
//! 적대 지문 목록은 설정에서 옵니다 — 목록 교체에 분류기 코드 수정이
//! 필요하지 않습니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use opensentinel_core::config::ClassifierConfig;
use opensentinel_core::error::{PipelineError, SentinelError};
use opensentinel_core::event::ThreatEvent;
use opensentinel_core::pipeline::{HealthStatus, Pipeline};
use opensentinel_core::types::{contains, Threat, ThreatLevel};

/// 분류 규칙만 적용합니다 (순수 함수).
///
/// 규칙이 산출한 심각도가 현재 값보다 높을 때만 갱신되므로,
/// 상류(UDP/ICMP)에서 지정한 L3는 페이로드 내용과 무관하게 유지됩니다.
pub fn classify(threat: &mut Threat, hostile_fingerprints: &[Vec<u8>]) {
    let assigned = if !threat.has_payload() {
        ThreatLevel::Level1
    } else if hostile_fingerprints
        .iter()
        .any(|fp| contains(threat.buffer(), fp))
    {
        ThreatLevel::Level3
    } else {
        ThreatLevel::Level2
    };

    threat.escalate_to(assigned);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassifierState {
    Initialized,
    Running,
    Stopped,
}

/// 위협 분류기
///
/// 빌더로 조립합니다:
/// ```ignore
/// let (classifier, alert_rx) = ThreatClassifierBuilder::new()
///     .config(config)
///     .threat_receiver(threat_rx)
///     .build()?;
/// ```
pub struct ThreatClassifier {
    fingerprints: Arc<Vec<Vec<u8>>>,
    threat_rx: Option<mpsc::Receiver<ThreatEvent>>,
    alert_tx: mpsc::Sender<ThreatEvent>,
    cancel: CancellationToken,
    state: ClassifierState,
    accepted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ThreatClassifier {
    /// 전달(수락)된 위협 수
    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// 기각된 위협 수
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Pipeline for ThreatClassifier {
    async fn start(&mut self) -> Result<(), SentinelError> {
        if self.state == ClassifierState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!("Threat classifier is starting...");

        let mut threat_rx = self
            .threat_rx
            .take()
            .ok_or(SentinelError::Pipeline(PipelineError::InitFailed(
                "threat receiver already consumed".to_owned(),
            )))?;

        let fingerprints = Arc::clone(&self.fingerprints);
        let alert_tx = self.alert_tx.clone();
        let cancel = self.cancel.clone();
        let accepted = Arc::clone(&self.accepted);
        let dropped = Arc::clone(&self.dropped);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = threat_rx.recv() => {
                        let Some(mut event) = event else { break };

                        debug!(
                            trace_id = %event.metadata.trace_id,
                            threat = %event.threat,
                            "classifier got threat"
                        );

                        classify(&mut event.threat, &fingerprints);

                        if event.threat.level() > ThreatLevel::Level0 {
                            info!(
                                trace_id = %event.metadata.trace_id,
                                protocol = %event.threat.protocol(),
                                level = %event.threat.level(),
                                "classifier checked threat, dispatching to alert dispatcher"
                            );
                            accepted.fetch_add(1, Ordering::Relaxed);
                            if let Err(err) = alert_tx.send(event).await {
                                debug!(error = %err, "alert channel closed, stopping classifier");
                                break;
                            }
                        } else {
                            info!(
                                trace_id = %event.metadata.trace_id,
                                protocol = %event.threat.protocol(),
                                level = %event.threat.level(),
                                sample = %event.threat.sample_preview(),
                                "classifier is dropping threat"
                            );
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        self.state = ClassifierState::Running;
        info!("Threat classifier has started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SentinelError> {
        info!("Threat classifier is stopping...");
        self.cancel.cancel();
        self.state = ClassifierState::Stopped;
        info!("Threat classifier has stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ClassifierState::Running => HealthStatus::Healthy,
            ClassifierState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ClassifierState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 위협 분류기 빌더
pub struct ThreatClassifierBuilder {
    config: ClassifierConfig,
    threat_rx: Option<mpsc::Receiver<ThreatEvent>>,
    alert_tx: Option<mpsc::Sender<ThreatEvent>>,
    alert_channel_capacity: usize,
}

impl ThreatClassifierBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: ClassifierConfig::default(),
            threat_rx: None,
            alert_tx: None,
            alert_channel_capacity: 256,
        }
    }

    /// 분류기 설정을 지정합니다.
    pub fn config(mut self, config: ClassifierConfig) -> Self {
        self.config = config;
        self
    }

    /// 센서들이 쓰는 위협 채널의 수신측을 연결합니다.
    pub fn threat_receiver(mut self, rx: mpsc::Receiver<ThreatEvent>) -> Self {
        self.threat_rx = Some(rx);
        self
    }

    /// 디스패처로 가는 알림 채널 송신측을 연결합니다.
    ///
    /// 설정하지 않으면 빌더가 새 채널을 만들어 수신측을 반환합니다.
    pub fn alert_sender(mut self, tx: mpsc::Sender<ThreatEvent>) -> Self {
        self.alert_tx = Some(tx);
        self
    }

    /// 내부 알림 채널 용량을 설정합니다 (외부 채널 미사용 시).
    pub fn alert_channel_capacity(mut self, capacity: usize) -> Self {
        self.alert_channel_capacity = capacity;
        self
    }

    /// 분류기를 빌드합니다.
    pub fn build(
        self,
    ) -> Result<(ThreatClassifier, Option<mpsc::Receiver<ThreatEvent>>), SentinelError> {
        let threat_rx = self
            .threat_rx
            .ok_or(SentinelError::Pipeline(PipelineError::InitFailed(
                "threat receiver is required".to_owned(),
            )))?;

        let (alert_tx, alert_rx) = match self.alert_tx {
            Some(tx) => (tx, None),
            None => {
                let (tx, rx) = mpsc::channel(self.alert_channel_capacity);
                (tx, Some(rx))
            }
        };

        let fingerprints = self
            .config
            .hostile_fingerprints
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        Ok((
            ThreatClassifier {
                fingerprints: Arc::new(fingerprints),
                threat_rx: Some(threat_rx),
                alert_tx,
                cancel: CancellationToken::new(),
                state: ClassifierState::Initialized,
                accepted: Arc::new(AtomicU64::new(0)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            alert_rx,
        ))
    }
}

impl Default for ThreatClassifierBuilder {
    fn default() -> Self {
        Self::new()
    }
}
