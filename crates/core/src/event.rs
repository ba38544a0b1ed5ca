//! 이벤트 시스템 — 센서에서 분류기/디스패처로 흐르는 메시지 단위
//!
//! 모든 모듈 간 통신은 `tokio::mpsc` 채널 위의 이벤트 패싱으로 수행됩니다.
//! [`ThreatEvent`]는 도메인 타입 [`Threat`]에 발생 시각, 생성 모듈,
//! 추적 ID를 덧붙인 봉투입니다.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::Threat;

// --- 모듈명 상수 ---

/// TCP 센서 모듈명
pub const MODULE_TCP_SENSOR: &str = "tcp-sensor";
/// UDP 센서 모듈명
pub const MODULE_UDP_SENSOR: &str = "udp-sensor";
/// ICMP 센서 모듈명
pub const MODULE_ICMP_SENSOR: &str = "icmp-sensor";
/// 위협 분류기 모듈명
pub const MODULE_CLASSIFIER: &str = "threat-classifier";
/// 알림 디스패처 모듈명
pub const MODULE_DISPATCHER: &str = "alert-dispatcher";

/// 위협 이벤트 타입명
pub const EVENT_TYPE_THREAT: &str = "threat";

/// 이벤트 메타데이터 — 모든 이벤트에 공통으로 포함되는 추적 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// 이벤트 발생 시각
    pub timestamp: SystemTime,
    /// 이벤트를 생성한 모듈명 (예: "tcp-sensor")
    pub source_module: String,
    /// 추적 ID — 같은 관측에서 파생된 이벤트를 연결합니다
    pub trace_id: String,
}

impl EventMetadata {
    /// 기존 trace_id를 사용하여 새 메타데이터를 생성합니다.
    pub fn new(source_module: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: trace_id.into(),
        }
    }

    /// 새로운 UUID v4 trace_id로 메타데이터를 만듭니다.
    pub fn with_new_trace(source_module: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for EventMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        write!(
            f,
            "[{}] source={} trace={}",
            secs, self.source_module, self.trace_id,
        )
    }
}

/// 센서가 관측한 위협 이벤트
///
/// 분류기를 거치면서 내부 `threat`의 심각도가 한 번 갱신된 뒤
/// 디스패처로 전달됩니다.
#[derive(Debug, Clone)]
pub struct ThreatEvent {
    /// 이벤트 고유 ID
    pub id: String,
    /// 이벤트 메타데이터
    pub metadata: EventMetadata,
    /// 관측된 위협
    pub threat: Threat,
}

impl ThreatEvent {
    /// 새로운 trace를 시작하는 위협 이벤트를 생성합니다.
    pub fn new(source_module: &'static str, threat: Threat) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::with_new_trace(source_module),
            threat,
        }
    }

    /// 이벤트 타입명 (로깅/라우팅에 사용)
    pub fn event_type(&self) -> &'static str {
        EVENT_TYPE_THREAT
    }
}

impl fmt::Display for ThreatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ThreatEvent[{}] {} from {}",
            &self.id[..8.min(self.id.len())],
            self.threat,
            self.metadata.source_module,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Protocol, Threat};

    fn sample_threat() -> Threat {
        Threat::without_sample(Protocol::Tcp, "192.0.2.7".parse().unwrap(), 8080)
    }

    #[test]
    fn event_metadata_new_preserves_trace_id() {
        let meta = EventMetadata::new("test-module", "trace-abc-123");
        assert_eq!(meta.source_module, "test-module");
        assert_eq!(meta.trace_id, "trace-abc-123");
        assert!(meta.timestamp <= SystemTime::now());
    }

    #[test]
    fn event_metadata_with_new_trace_generates_uuid() {
        let meta = EventMetadata::with_new_trace("tcp-sensor");
        // UUID v4 형식 확인: 8-4-4-4-12
        assert_eq!(meta.trace_id.len(), 36);
        assert_eq!(meta.trace_id.chars().filter(|c| *c == '-').count(), 4);
    }

    #[test]
    fn threat_event_carries_source_module() {
        let event = ThreatEvent::new(MODULE_TCP_SENSOR, sample_threat());
        assert_eq!(event.metadata.source_module, "tcp-sensor");
        assert_eq!(event.event_type(), "threat");
        assert!(!event.id.is_empty());
    }

    #[test]
    fn threat_event_display() {
        let event = ThreatEvent::new(MODULE_UDP_SENSOR, sample_threat());
        let display = event.to_string();
        assert!(display.contains("ThreatEvent"));
        assert!(display.contains("192.0.2.7"));
        assert!(display.contains("udp-sensor"));
    }

    #[test]
    fn events_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<ThreatEvent>();
        assert_send_sync::<EventMetadata>();
    }
}
