//! 파이프라인 trait — 모듈 생명주기 정의
//!
//! [`Pipeline`] trait은 스택이 관리하는 모든 컴포넌트(센서, 분류기,
//! 디스패처)가 구현하는 생명주기 인터페이스입니다. 스택은 컴포넌트를
//! 순서대로 시작하고 역순으로 정지합니다.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::SentinelError;

/// dyn-compatible Future 타입 별칭
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 모든 컴포넌트가 구현하는 생명주기 trait
///
/// # 구현 규약
/// - `start`는 필요한 소켓을 열고 워커 태스크를 스폰합니다. 이미 실행 중이면
///   `PipelineError::AlreadyRunning`을 반환합니다.
/// - `stop`은 멱등하게 동작해야 합니다. 타이머를 취소하고 소켓을 닫은 뒤
///   워커 태스크가 끝나기를 기다립니다.
pub trait Pipeline: Send + Sync {
    /// 컴포넌트를 시작합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), SentinelError>> + Send;

    /// 컴포넌트를 정지합니다 (graceful shutdown).
    fn stop(&mut self) -> impl Future<Output = Result<(), SentinelError>> + Send;

    /// 컴포넌트의 현재 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// dyn-compatible 파이프라인 trait
///
/// `Pipeline` trait은 RPITIT를 사용하므로 `dyn Pipeline`이 불가합니다.
/// `DynPipeline`은 `BoxFuture`를 반환하여 `Vec<Box<dyn DynPipeline>>`으로
/// 컴포넌트를 동적 관리할 수 있게 합니다.
pub trait DynPipeline: Send + Sync {
    /// 컴포넌트를 시작합니다.
    fn start(&mut self) -> BoxFuture<'_, Result<(), SentinelError>>;

    /// 컴포넌트를 정지합니다.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), SentinelError>>;

    /// 컴포넌트의 현재 상태를 확인합니다.
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Pipeline> DynPipeline for T {
    fn start(&mut self) -> BoxFuture<'_, Result<(), SentinelError>> {
        Box::pin(Pipeline::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), SentinelError>> {
        Box::pin(Pipeline::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Pipeline::health_check(self))
    }
}

/// 컴포넌트 헬스 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 정상 동작 중
    Healthy,
    /// 성능 저하 또는 부분적 장애 (서비스는 계속 동작)
    Degraded(String),
    /// 비정상 — 서비스 불가 상태
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 비정상 상태인지 확인합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    #[test]
    fn health_status_predicates() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Healthy.is_unhealthy());

        let degraded = HealthStatus::Degraded("slow".to_owned());
        assert!(!degraded.is_healthy());
        assert!(!degraded.is_unhealthy());

        let unhealthy = HealthStatus::Unhealthy("stopped".to_owned());
        assert!(unhealthy.is_unhealthy());
    }

    #[test]
    fn health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert!(
            HealthStatus::Degraded("high latency".to_owned())
                .to_string()
                .contains("high latency")
        );
    }

    // Pipeline trait 구현 테스트를 위한 mock
    struct MockPipeline {
        running: bool,
    }

    impl Pipeline for MockPipeline {
        async fn start(&mut self) -> Result<(), SentinelError> {
            if self.running {
                return Err(PipelineError::AlreadyRunning.into());
            }
            self.running = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), SentinelError> {
            self.running = false;
            Ok(())
        }

        async fn health_check(&self) -> HealthStatus {
            if self.running {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy("not running".to_owned())
            }
        }
    }

    #[tokio::test]
    async fn mock_pipeline_lifecycle() {
        let mut pipeline = MockPipeline { running: false };

        assert!(Pipeline::health_check(&pipeline).await.is_unhealthy());

        Pipeline::start(&mut pipeline).await.unwrap();
        assert!(Pipeline::health_check(&pipeline).await.is_healthy());

        // 중복 시작 시 에러
        assert!(Pipeline::start(&mut pipeline).await.is_err());

        // 정지는 멱등
        Pipeline::stop(&mut pipeline).await.unwrap();
        Pipeline::stop(&mut pipeline).await.unwrap();
        assert!(Pipeline::health_check(&pipeline).await.is_unhealthy());
    }

    #[tokio::test]
    async fn dyn_pipeline_can_be_boxed() {
        let mut pipeline: Box<dyn DynPipeline> = Box::new(MockPipeline { running: false });

        pipeline.start().await.unwrap();
        assert!(pipeline.health_check().await.is_healthy());
        pipeline.stop().await.unwrap();
        assert!(pipeline.health_check().await.is_unhealthy());
    }
}
