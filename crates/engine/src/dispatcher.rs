//! 알림 디스패처 — 중복 억제와 외부 명령 호출
//!
//! 디스패처 태스크는 알림 채널의 단독 소비자이며 [`AlertCache`]를 단독
//! 소유합니다. 새 지문이면 캐시에 기록하고 외부 명령을 분리 태스크로
//! 실행합니다 — 디스패처는 명령 종료를 기다리지 않고, 종료 코드는
//! 로그로만 남깁니다. 1초 틱이 만료 항목을 청소합니다.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use opensentinel_core::config::AlertConfig;
use opensentinel_core::error::{PipelineError, SentinelError};
use opensentinel_core::event::ThreatEvent;
use opensentinel_core::pipeline::{HealthStatus, Pipeline};
use opensentinel_core::types::Alert;

use crate::cache::{AlertCache, CacheDecision};
use crate::executor::{install_default_script, AlertExecutor, ShellAlertExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatcherState {
    Initialized,
    Running,
    Stopped,
}

/// 알림 디스패처
pub struct AlertDispatcher {
    data_dir: PathBuf,
    config: AlertConfig,
    alert_rx: Option<mpsc::Receiver<ThreatEvent>>,
    executor: Arc<dyn AlertExecutor>,
    cancel: CancellationToken,
    state: DispatcherState,
    dispatched: Arc<AtomicU64>,
    suppressed: Arc<AtomicU64>,
}

impl AlertDispatcher {
    /// 외부 명령이 실행된 알림 수
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// 중복으로 억제된 알림 수
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// 대응 스크립트의 전체 경로
    pub fn script_path(&self) -> PathBuf {
        self.data_dir.join(&self.config.script_name)
    }
}

impl Pipeline for AlertDispatcher {
    async fn start(&mut self) -> Result<(), SentinelError> {
        if self.state == DispatcherState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!("Alert dispatcher is starting...");

        // 스크립트가 없으면 기본 본문으로 설치합니다. 기존 파일은 보존.
        let script = install_default_script(&self.data_dir, &self.config.script_name)?;

        let mut alert_rx = self
            .alert_rx
            .take()
            .ok_or(SentinelError::Pipeline(PipelineError::InitFailed(
                "alert receiver already consumed".to_owned(),
            )))?;

        let mut cache = AlertCache::new(Duration::from_secs(self.config.dedup_window_secs));
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.clone();
        let dispatched = Arc::clone(&self.dispatched);
        let suppressed = Arc::clone(&self.suppressed);

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => cache.purge_expired(),
                    event = alert_rx.recv() => {
                        let Some(event) = event else { break };
                        handle_alert(
                            event,
                            &mut cache,
                            &script,
                            &executor,
                            &dispatched,
                            &suppressed,
                        );
                    }
                }
            }
        });

        self.state = DispatcherState::Running;
        info!("Alert dispatcher has started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SentinelError> {
        info!("Alert dispatcher is stopping...");
        self.cancel.cancel();
        self.state = DispatcherState::Stopped;
        info!("Alert dispatcher has stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            DispatcherState::Running => HealthStatus::Healthy,
            DispatcherState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            DispatcherState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 알림 하나를 처리합니다 — 디스패처 태스크 안에서만 호출됩니다.
fn handle_alert(
    event: ThreatEvent,
    cache: &mut AlertCache,
    script: &std::path::Path,
    executor: &Arc<dyn AlertExecutor>,
    dispatched: &Arc<AtomicU64>,
    suppressed: &Arc<AtomicU64>,
) {
    let alert = Alert::new(event.threat);
    let fingerprint = alert.fingerprint();

    match cache.check_and_insert(&fingerprint) {
        CacheDecision::Suppress(remaining) => {
            info!(
                fingerprint = %fingerprint,
                remaining_secs = remaining.as_secs(),
                "duplicate alert fingerprint, dropping"
            );
            suppressed.fetch_add(1, Ordering::Relaxed);
        }
        CacheDecision::Fire => {
            let display_str = alert.display();
            info!(
                fingerprint = %fingerprint,
                display = %display_str,
                script = %script.display(),
                "executing alert command"
            );
            dispatched.fetch_add(1, Ordering::Relaxed);

            // 명령은 분리 태스크에서 돌고, 종료 코드는 로그로만 남습니다.
            let run = executor.execute(script.to_path_buf(), display_str);
            let trace_id = event.metadata.trace_id;
            tokio::spawn(async move {
                match run.await {
                    Ok(code) => {
                        info!(trace_id = %trace_id, code = ?code, "alert command finished");
                    }
                    Err(err) => {
                        error!(trace_id = %trace_id, error = %err, "alert command failed");
                    }
                }
            });
        }
    }
}

/// 알림 디스패처 빌더
pub struct AlertDispatcherBuilder {
    data_dir: Option<PathBuf>,
    config: AlertConfig,
    alert_rx: Option<mpsc::Receiver<ThreatEvent>>,
    executor: Arc<dyn AlertExecutor>,
}

impl AlertDispatcherBuilder {
    /// 새 빌더를 생성합니다. 기본 실행기는 [`ShellAlertExecutor`]입니다.
    pub fn new() -> Self {
        Self {
            data_dir: None,
            config: AlertConfig::default(),
            alert_rx: None,
            executor: Arc::new(ShellAlertExecutor),
        }
    }

    /// 데이터 디렉토리를 지정합니다 (스크립트 위치).
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// 디스패처 설정을 지정합니다.
    pub fn config(mut self, config: AlertConfig) -> Self {
        self.config = config;
        self
    }

    /// 분류기에서 오는 알림 채널의 수신측을 연결합니다.
    pub fn alert_receiver(mut self, rx: mpsc::Receiver<ThreatEvent>) -> Self {
        self.alert_rx = Some(rx);
        self
    }

    /// 외부 명령 실행기를 교체합니다 (테스트 주입용).
    pub fn executor(mut self, executor: Arc<dyn AlertExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// 디스패처를 빌드합니다.
    pub fn build(self) -> Result<AlertDispatcher, SentinelError> {
        let alert_rx = self
            .alert_rx
            .ok_or(SentinelError::Pipeline(PipelineError::InitFailed(
                "alert receiver is required".to_owned(),
            )))?;
        let data_dir = self
            .data_dir
            .ok_or(SentinelError::Pipeline(PipelineError::InitFailed(
                "data dir is required".to_owned(),
            )))?;

        Ok(AlertDispatcher {
            data_dir,
            config: self.config,
            alert_rx: Some(alert_rx),
            executor: self.executor,
            cancel: CancellationToken::new(),
            state: DispatcherState::Initialized,
            dispatched: Arc::new(AtomicU64::new(0)),
            suppressed: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl Default for AlertDispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
