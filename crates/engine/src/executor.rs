//! 외부 명령 실행기 — 대응 스크립트 호출
//!
//! 디스패처는 [`AlertExecutor`] trait 뒤의 구현으로 외부 명령을 실행합니다.
//! 기본 구현([`ShellAlertExecutor`])은 스크립트를 자식 프로세스로 직접
//! 스폰합니다 — 경로는 프로그램 인자라 공백이 있어도 안전하고, 표시
//! 문자열은 단일 인자(`$1`)로 전달됩니다. 테스트는 기록용 구현을
//! 주입합니다.

use std::path::{Path, PathBuf};

use tracing::debug;

use opensentinel_core::error::DispatchError;
use opensentinel_core::pipeline::BoxFuture;

/// 최초 기동 시 설치되는 기본 대응 스크립트
pub const DEFAULT_SCRIPT_BODY: &str = "#!/bin/bash\n\
echo \"OpenSentinel got threat alert from $1.\"\n\
echo \"Taking action...\"\n";

/// 알림 외부 명령 실행 trait
///
/// 반환값은 프로세스 종료 코드입니다 (시그널로 죽으면 `None`).
pub trait AlertExecutor: Send + Sync {
    /// 스크립트를 표시 문자열 인자 하나로 실행합니다.
    fn execute(
        &self,
        script: PathBuf,
        display: String,
    ) -> BoxFuture<'static, Result<Option<i32>, DispatchError>>;
}

/// 스크립트를 자식 프로세스로 스폰하는 기본 실행기
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellAlertExecutor;

impl AlertExecutor for ShellAlertExecutor {
    fn execute(
        &self,
        script: PathBuf,
        display: String,
    ) -> BoxFuture<'static, Result<Option<i32>, DispatchError>> {
        Box::pin(async move {
            debug!(script = %script.display(), "executing alert command");

            let status = tokio::process::Command::new(&script)
                .arg(&display)
                .status()
                .await
                .map_err(|e| DispatchError::CommandFailed(e.to_string()))?;

            Ok(status.code())
        })
    }
}

/// 대응 스크립트가 없으면 기본 본문으로 설치합니다.
///
/// 기존 파일은 절대 덮어쓰지 않습니다. Unix에서는 실행 권한(0755)을
/// 부여합니다. 설치 여부와 관계없이 스크립트 경로를 반환합니다.
pub fn install_default_script(data_dir: &Path, name: &str) -> Result<PathBuf, DispatchError> {
    let path = data_dir.join(name);

    if path.exists() {
        return Ok(path);
    }

    debug!(path = %path.display(), "initializing default threat_alert script");

    std::fs::write(&path, DEFAULT_SCRIPT_BODY).map_err(|e| DispatchError::ScriptInstall {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
            DispatchError::ScriptInstall {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_default_script_once() {
        let dir = tempfile::tempdir().unwrap();

        let path = install_default_script(dir.path(), "threat_alert.sh").unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("#!/bin/bash"));
        assert!(body.contains("OpenSentinel got threat alert from $1."));
        assert!(body.contains("Taking action..."));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn existing_script_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let custom = dir.path().join("threat_alert.sh");
        std::fs::write(&custom, "#!/bin/bash\n# operator customized\n").unwrap();

        let path = install_default_script(dir.path(), "threat_alert.sh").unwrap();
        assert_eq!(path, custom);
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("operator customized"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_executor_passes_display_as_single_argument() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("out.txt");
        let script = dir.path().join("record.sh");
        std::fs::write(
            &script,
            format!("#!/bin/bash\nprintf '%s' \"$1\" > '{}'\n", out_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let display = "203.0.113.5:1234,TCP,LEVEL_3,464f4f".to_owned();
        let code = ShellAlertExecutor
            .execute(script, display.clone())
            .await
            .unwrap();

        assert_eq!(code, Some(0));
        assert_eq!(std::fs::read_to_string(&out_file).unwrap(), display);
    }

    #[tokio::test]
    async fn missing_script_reports_command_failed() {
        let result = ShellAlertExecutor
            .execute(PathBuf::from("/nonexistent/threat_alert.sh"), String::new())
            .await;
        assert!(matches!(result, Err(DispatchError::CommandFailed(_))));
    }
}
