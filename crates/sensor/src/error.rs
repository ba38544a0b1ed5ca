//! 센서 크레이트 에러 타입
//!
//! 소켓/파싱 에러는 core의 [`NetError`]/[`ParseError`](opensentinel_core::ParseError)를
//! 그대로 사용하고, 여기서는 트랜스포트 종결 사유만 추가로 정의합니다.

use opensentinel_core::error::{NetError, SentinelError};

/// 트랜스포트를 종결시키는 에러
///
/// 모두 터미널이며 `stop()`을 유발합니다. `ConnectFailed`/`ConnectTimeout`만
/// `on_complete` 콜백으로 보고되고, 나머지는 조용히 닫습니다.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 호스트 해석 또는 연결 실패
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// 연결 타임아웃 (8초)
    #[error("connect timed out")]
    ConnectTimeout,

    /// 읽기 실패
    #[error("read error: {0}")]
    ReadError(String),

    /// 쓰기 실패
    #[error("write error: {0}")]
    WriteError(String),

    /// 읽기 타임아웃
    #[error("read timed out")]
    ReadTimeout,

    /// 쓰기 타임아웃
    #[error("write timed out")]
    WriteTimeout,
}

impl From<TransportError> for SentinelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectFailed(reason) => {
                SentinelError::Net(NetError::ResolveFailed(reason))
            }
            TransportError::ConnectTimeout => {
                SentinelError::Net(NetError::Timeout("connect".to_owned()))
            }
            TransportError::ReadError(reason) => SentinelError::Net(NetError::ReadError(reason)),
            TransportError::WriteError(reason) => SentinelError::Net(NetError::WriteError(reason)),
            TransportError::ReadTimeout => SentinelError::Net(NetError::Timeout("read".to_owned())),
            TransportError::WriteTimeout => {
                SentinelError::Net(NetError::Timeout("write".to_owned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        assert!(
            TransportError::ConnectFailed("no route".to_owned())
                .to_string()
                .contains("no route")
        );
        assert_eq!(TransportError::ReadTimeout.to_string(), "read timed out");
    }

    #[test]
    fn converts_to_sentinel_error() {
        let err: SentinelError = TransportError::ReadTimeout.into();
        assert!(matches!(err, SentinelError::Net(NetError::Timeout(_))));

        let err: SentinelError = TransportError::WriteError("pipe".to_owned()).into();
        assert!(matches!(err, SentinelError::Net(NetError::WriteError(_))));
    }
}
