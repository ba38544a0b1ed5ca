//! Stack orchestration -- component assembly, channel wiring, and lifecycle.
//!
//! The [`Stack`] composes the sensors with the classifier and dispatcher:
//!
//! ```text
//! TcpSensor ──┐
//! UdpSensor ──┼─ mpsc(threats) ─> ThreatClassifier ─ mpsc(alerts) ─> AlertDispatcher
//! IcmpReceiver┘
//! ```
//!
//! # Startup order
//!
//! 1. data directory + fd limit
//! 2. TCP sensor
//! 3. Threat classifier
//! 4. Alert dispatcher
//! 5. ICMP receiver (failure is non-fatal: typically missing privileges)
//! 6. UDP sensor
//!
//! # Shutdown order
//!
//! Reverse of startup. Each component's `stop` is idempotent.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use opensentinel_core::config::SentinelConfig;
use opensentinel_core::error::SentinelError;
use opensentinel_core::event::ThreatEvent;
use opensentinel_core::fs;
use opensentinel_core::pipeline::{HealthStatus, Pipeline};
use opensentinel_engine::{
    AlertDispatcher, AlertDispatcherBuilder, AlertExecutor, ShellAlertExecutor, ThreatClassifier,
    ThreatClassifierBuilder,
};
use opensentinel_sensor::{IcmpReceiver, TcpSensor, UdpSensor};

use crate::limits;

/// Sensor -> classifier channel capacity.
const THREAT_CHANNEL_CAPACITY: usize = 1024;

/// Classifier -> dispatcher channel capacity.
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// The assembled honeypot stack.
pub struct Stack {
    data_dir: PathBuf,
    fd_limit_target: u64,
    tcp: Option<TcpSensor>,
    udp: Option<UdpSensor>,
    icmp: Option<IcmpReceiver>,
    classifier: ThreatClassifier,
    dispatcher: AlertDispatcher,
    icmp_active: bool,
    running: bool,
}

impl Stack {
    /// Build the stack with the default shell executor.
    pub fn build(config: SentinelConfig) -> Result<Self, SentinelError> {
        Self::build_with_executor(config, Arc::new(ShellAlertExecutor))
    }

    /// Build the stack with an injected alert executor (used by tests).
    pub fn build_with_executor(
        config: SentinelConfig,
        executor: Arc<dyn AlertExecutor>,
    ) -> Result<Self, SentinelError> {
        config.validate()?;

        let data_dir = config.resolved_data_dir();

        let (threat_tx, threat_rx) = mpsc::channel::<ThreatEvent>(THREAT_CHANNEL_CAPACITY);
        let (alert_tx, alert_rx) = mpsc::channel::<ThreatEvent>(ALERT_CHANNEL_CAPACITY);

        let (classifier, _) = ThreatClassifierBuilder::new()
            .config(config.classifier.clone())
            .threat_receiver(threat_rx)
            .alert_sender(alert_tx)
            .build()?;

        let dispatcher = AlertDispatcherBuilder::new()
            .data_dir(&data_dir)
            .config(config.alert.clone())
            .alert_receiver(alert_rx)
            .executor(executor)
            .build()?;

        let tcp = config
            .tcp
            .enabled
            .then(|| TcpSensor::new(config.tcp.clone(), threat_tx.clone()));
        let udp = config
            .udp
            .enabled
            .then(|| UdpSensor::new(config.udp.clone(), threat_tx.clone()));
        let icmp = config
            .icmp
            .enabled
            .then(|| IcmpReceiver::new(threat_tx.clone()));

        Ok(Self {
            data_dir,
            fd_limit_target: config.general.fd_limit,
            tcp,
            udp,
            icmp,
            classifier,
            dispatcher,
            icmp_active: false,
            running: false,
        })
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Whether the ICMP receiver actually came up.
    pub fn icmp_active(&self) -> bool {
        self.icmp_active
    }

    /// Start every component in dependency order.
    pub async fn start(&mut self) -> Result<(), SentinelError> {
        info!("Stack is starting...");

        info!(path = %self.data_dir.display(), "initializing data directory");
        fs::create_path(&self.data_dir)?;

        let fd_limit = limits::raise_file_descriptor_limit(self.fd_limit_target);
        info!(fd_limit, "file descriptor limit set");

        if let Some(tcp) = &mut self.tcp {
            tcp.start().await?;
        }

        self.classifier.start().await?;
        self.dispatcher.start().await?;

        // Raw sockets need privileges; running without ICMP is acceptable.
        if let Some(icmp) = &mut self.icmp {
            match icmp.start().await {
                Ok(()) => self.icmp_active = true,
                Err(err) => {
                    error!(error = %err, "failed to start ICMP receiver, continuing without it");
                }
            }
        }

        if let Some(udp) = &mut self.udp {
            udp.start().await?;
        }

        self.running = true;
        info!("Stack has started");
        Ok(())
    }

    /// Stop every component in reverse order.
    pub async fn stop(&mut self) -> Result<(), SentinelError> {
        info!("Stack is stopping...");

        if let Some(udp) = &mut self.udp {
            if let Err(err) = udp.stop().await {
                error!(error = %err, "failed to stop UDP sensor");
            }
        }

        if self.icmp_active {
            if let Some(icmp) = &mut self.icmp {
                if let Err(err) = icmp.stop().await {
                    error!(error = %err, "failed to stop ICMP receiver");
                }
            }
            self.icmp_active = false;
        }

        if let Err(err) = self.dispatcher.stop().await {
            error!(error = %err, "failed to stop alert dispatcher");
        }
        if let Err(err) = self.classifier.stop().await {
            error!(error = %err, "failed to stop threat classifier");
        }

        if let Some(tcp) = &mut self.tcp {
            if let Err(err) = tcp.stop().await {
                error!(error = %err, "failed to stop TCP sensor");
            }
        }

        self.running = false;
        info!("Stack has stopped");
        Ok(())
    }

    /// Aggregate health across all components.
    pub async fn health(&self) -> Vec<(&'static str, HealthStatus)> {
        let mut out = Vec::new();
        if let Some(tcp) = &self.tcp {
            out.push(("tcp-sensor", tcp.health_check().await));
        }
        if let Some(udp) = &self.udp {
            out.push(("udp-sensor", udp.health_check().await));
        }
        if let Some(icmp) = &self.icmp {
            out.push(("icmp-sensor", icmp.health_check().await));
        }
        out.push(("threat-classifier", self.classifier.health_check().await));
        out.push(("alert-dispatcher", self.dispatcher.health_check().await));
        out
    }
}
