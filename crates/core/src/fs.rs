//! 파일시스템 헬퍼 — 데이터 디렉토리 탐색과 생성
//!
//! 데몬이 쓰는 모든 파일(`debug.log`, `threat_alert.sh`, 설정 파일)은
//! 플랫폼별 데이터 디렉토리 아래에 위치합니다.

use std::io;
use std::path::{Path, PathBuf};

/// 애플리케이션 이름 — 데이터 디렉토리 경로에 사용됩니다.
pub const APP_NAME: &str = "opensentinel";

/// 플랫폼별 데이터 디렉토리를 반환합니다.
///
/// - Windows: `%APPDATA%\opensentinel\`
/// - macOS: `~/Library/Application Support/opensentinel/`
/// - 기타 Unix: `~/.opensentinel/data/`
pub fn data_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        match std::env::var_os("APPDATA") {
            Some(appdata) => PathBuf::from(appdata).join(APP_NAME),
            None => home_path().join(APP_NAME),
        }
    }
    #[cfg(target_os = "macos")]
    {
        home_path()
            .join("Library")
            .join("Application Support")
            .join(APP_NAME)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        home_path().join(format!(".{APP_NAME}")).join("data")
    }
}

/// 홈 디렉토리를 반환합니다. 찾지 못하면 현재 디렉토리로 대체합니다.
pub fn home_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home);
    }
    if let Some(profile) = std::env::var_os("USERPROFILE") {
        return PathBuf::from(profile);
    }
    match (std::env::var_os("HOMEDRIVE"), std::env::var_os("HOMEPATH")) {
        (Some(drive), Some(path)) => {
            let mut buf = PathBuf::from(drive);
            buf.push(path);
            buf
        }
        _ => PathBuf::from("."),
    }
}

/// 디렉토리 경로를 생성합니다 (이미 있으면 성공).
///
/// Unix에서는 소유자 전용 권한(0700)으로 생성합니다.
pub fn create_path(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o700).recursive(true);
        builder.create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_path_mentions_app_name() {
        let path = data_path();
        assert!(path.to_string_lossy().contains(APP_NAME));
    }

    #[test]
    fn home_path_is_not_empty() {
        let home = home_path();
        assert!(!home.as_os_str().is_empty());
    }

    #[test]
    fn create_path_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b");

        create_path(&target).unwrap();
        assert!(target.is_dir());

        // 두 번째 호출도 성공해야 합니다.
        create_path(&target).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn create_path_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("private");
        create_path(&target).unwrap();

        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
