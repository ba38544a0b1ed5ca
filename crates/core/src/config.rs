//! 설정 관리 — opensentinel.toml 파싱 및 런타임 설정
//!
//! 데몬은 커맨드라인 플래그 없이 `<data_dir>/opensentinel.toml`이 있으면
//! 읽고, 없으면 기본값으로 동작합니다.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fs;

/// 기본 포트 범위 — NetBIOS(137-139)와 bootps/bootpc(67-68)는 의도적으로
/// 건너뜁니다.
pub const DEFAULT_PORT_RANGES: [(u16, u16); 4] =
    [(1, 66), (69, 136), (140, 2028), (8080, 8280)];

/// OpenSentinel 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// 일반 설정
    pub general: GeneralConfig,
    /// TCP 센서 설정
    pub tcp: TcpConfig,
    /// UDP 센서 설정
    pub udp: UdpConfig,
    /// ICMP 센서 설정
    pub icmp: IcmpConfig,
    /// 위협 분류기 설정
    pub classifier: ClassifierConfig,
    /// 알림 디스패처 설정
    pub alert: AlertConfig,
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (tracing EnvFilter 문법)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// 데이터 디렉토리 (빈 문자열이면 플랫폼 기본값)
    pub data_dir: String,
    /// 파일 디스크립터 한도 목표치
    pub fd_limit: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            data_dir: String::new(),
            fd_limit: 16_384,
        }
    }
}

/// TCP 센서 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 청취할 포트 범위 (양끝 포함)
    pub port_ranges: Vec<(u16, u16)>,
    /// 수락된 연결의 읽기 타임아웃 (초)
    pub read_timeout_secs: u64,
    /// 수락된 연결의 쓰기 타임아웃 (초)
    pub write_timeout_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_ranges: DEFAULT_PORT_RANGES.to_vec(),
            read_timeout_secs: 5,
            write_timeout_secs: 5,
        }
    }
}

/// UDP 센서 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 청취할 포트 범위 (양끝 포함)
    pub port_ranges: Vec<(u16, u16)>,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port_ranges: DEFAULT_PORT_RANGES.to_vec(),
        }
    }
}

/// ICMP 센서 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpConfig {
    /// 활성화 여부 — raw 소켓은 권한이 필요하며, 열기에 실패해도
    /// 나머지 시스템은 계속 동작합니다.
    pub enabled: bool,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// 위협 분류기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// 적대 지문 목록 — 샘플에 이 부분 문자열이 보이면 L3로 격상합니다.
    /// 분류기 코드를 고치지 않고 교체할 수 있습니다.
    pub hostile_fingerprints: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hostile_fingerprints: vec!["FOO".to_owned()],
        }
    }
}

/// 알림 디스패처 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// 지문별 중복 억제 윈도우 (초)
    pub dedup_window_secs: u64,
    /// 캐시 청소 주기 (초)
    pub sweep_interval_secs: u64,
    /// 대응 스크립트 파일명 (data_dir 기준)
    pub script_name: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 60,
            sweep_interval_secs: 1,
            script_name: "threat_alert.sh".to_owned(),
        }
    }
}

impl SentinelConfig {
    /// TOML 파일에서 설정을 읽습니다.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| ConfigError::FileNotFound {
                path: path.display().to_string(),
            })?;

        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// 파일이 있으면 읽고, 없으면 기본값을 반환합니다.
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.general.log_format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "general.log_format".to_owned(),
                    reason: format!("unknown format '{other}', expected 'json' or 'pretty'"),
                });
            }
        }

        validate_ranges("tcp.port_ranges", &self.tcp.port_ranges)?;
        validate_ranges("udp.port_ranges", &self.udp.port_ranges)?;

        if self.alert.dedup_window_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "alert.dedup_window_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        if self.alert.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "alert.sweep_interval_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }

        if self.alert.script_name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "alert.script_name".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }

        for fp in &self.classifier.hostile_fingerprints {
            if fp.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "classifier.hostile_fingerprints".to_owned(),
                    reason: "fingerprint entries must not be empty".to_owned(),
                });
            }
        }

        Ok(())
    }

    /// 데이터 디렉토리를 확정합니다 (설정값 또는 플랫폼 기본값).
    pub fn resolved_data_dir(&self) -> PathBuf {
        if self.general.data_dir.is_empty() {
            fs::data_path()
        } else {
            PathBuf::from(&self.general.data_dir)
        }
    }
}

/// 포트 범위 목록을 검증합니다.
fn validate_ranges(field: &str, ranges: &[(u16, u16)]) -> Result<(), ConfigError> {
    if ranges.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: field.to_owned(),
            reason: "at least one port range is required".to_owned(),
        });
    }

    for (begin, end) in ranges {
        if *begin == 0 || begin > end {
            return Err(ConfigError::InvalidValue {
                field: field.to_owned(),
                reason: format!("invalid range [{begin}, {end}]"),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SentinelConfig::default().validate().unwrap();
    }

    #[test]
    fn default_port_ranges_skip_netbios_and_bootp() {
        let config = SentinelConfig::default();
        assert_eq!(config.tcp.port_ranges.len(), 4);
        assert_eq!(config.tcp.port_ranges[0], (1, 66));
        assert_eq!(config.tcp.port_ranges[1], (69, 136));
        assert_eq!(config.tcp.port_ranges[2], (140, 2028));
        assert_eq!(config.tcp.port_ranges[3], (8080, 8280));
        assert_eq!(config.udp.port_ranges, config.tcp.port_ranges);
    }

    #[test]
    fn default_hostile_fingerprint_is_foo() {
        let config = SentinelConfig::default();
        assert_eq!(config.classifier.hostile_fingerprints, vec!["FOO"]);
    }

    #[test]
    fn default_timeouts_and_ttl() {
        let config = SentinelConfig::default();
        assert_eq!(config.tcp.read_timeout_secs, 5);
        assert_eq!(config.tcp.write_timeout_secs, 5);
        assert_eq!(config.alert.dedup_window_secs, 60);
        assert_eq!(config.alert.sweep_interval_secs, 1);
        assert_eq!(config.general.fd_limit, 16_384);
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let mut config = SentinelConfig::default();
        config.tcp.port_ranges = vec![(100, 50)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_port_zero() {
        let mut config = SentinelConfig::default();
        config.udp.port_ranges = vec![(0, 10)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_ranges() {
        let mut config = SentinelConfig::default();
        config.tcp.port_ranges.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_log_format() {
        let mut config = SentinelConfig::default();
        config.general.log_format = "xml".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_dedup_window() {
        let mut config = SentinelConfig::default();
        config.alert.dedup_window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_fingerprint_entry() {
        let mut config = SentinelConfig::default();
        config.classifier.hostile_fingerprints = vec![String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolved_data_dir_prefers_configured_value() {
        let mut config = SentinelConfig::default();
        config.general.data_dir = "/tmp/sentinel-test".to_owned();
        assert_eq!(
            config.resolved_data_dir(),
            PathBuf::from("/tmp/sentinel-test")
        );

        config.general.data_dir.clear();
        assert!(
            config
                .resolved_data_dir()
                .to_string_lossy()
                .contains("opensentinel")
        );
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let raw = r#"
            [general]
            log_level = "debug"

            [tcp]
            port_ranges = [[49000, 49010]]
        "#;
        let config: SentinelConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.tcp.port_ranges, vec![(49000, 49010)]);
        // 지정하지 않은 섹션은 기본값
        assert_eq!(config.alert.dedup_window_secs, 60);
        assert!(config.icmp.enabled);
    }

    #[tokio::test]
    async fn load_or_default_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SentinelConfig::load_or_default(&dir.path().join("missing.toml"))
            .await
            .unwrap();
        assert_eq!(config.alert.script_name, "threat_alert.sh");
    }

    #[tokio::test]
    async fn load_parses_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opensentinel.toml");
        tokio::fs::write(
            &path,
            r#"
                [classifier]
                hostile_fingerprints = ["EVIL", "FOO"]
            "#,
        )
        .await
        .unwrap();

        let config = SentinelConfig::load(&path).await.unwrap();
        assert_eq!(config.classifier.hostile_fingerprints.len(), 2);

        // 잘못된 설정은 load 단계에서 거부됩니다.
        tokio::fs::write(&path, "[alert]\ndedup_window_secs = 0\n")
            .await
            .unwrap();
        assert!(SentinelConfig::load(&path).await.is_err());
    }
}
