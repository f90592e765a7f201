use std::{
    env,
    path::{Path, PathBuf},
};

pub const BACKEND_RESOURCE_DIR: &str = "backend";
pub const BACKEND_EXECUTABLE_STEM: &str = "db-toolkit-backend";

pub fn backend_executable_file_name() -> String {
    if cfg!(target_os = "windows") {
        format!("{BACKEND_EXECUTABLE_STEM}.exe")
    } else {
        BACKEND_EXECUTABLE_STEM.to_string()
    }
}

/// Location of the bundled backend inside a packaged app's resources.
pub fn packaged_backend_executable(resources_dir: &Path) -> PathBuf {
    resources_dir
        .join(BACKEND_RESOURCE_DIR)
        .join(backend_executable_file_name())
}

/// Picks the backend executable: explicit override, then the packaged
/// resources layout. `None` selects development mode.
///
/// A packaged path is returned even when the file is missing so that the
/// launcher reports `ExecutableNotFound` instead of silently falling back.
pub fn resolve_backend_executable<F>(
    override_env: &str,
    resources_dir: Option<&Path>,
    mut log: F,
) -> Option<PathBuf>
where
    F: FnMut(String),
{
    if let Some(raw) = env::var_os(override_env) {
        let candidate = PathBuf::from(raw);
        if !candidate.as_os_str().is_empty() {
            return Some(candidate);
        }
        log(format!("{override_env} is empty, ignoring override"));
    }

    let resources_dir = resources_dir?;
    let packaged = packaged_backend_executable(resources_dir);
    if !packaged.is_file() {
        log(format!(
            "packaged backend executable is missing: {}",
            packaged.display()
        ));
    }
    Some(packaged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn packaged_backend_lives_under_backend_resource_dir() {
        let path = packaged_backend_executable(Path::new("/opt/app/resources"));
        assert!(path.starts_with("/opt/app/resources/backend"));
        assert!(path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(BACKEND_EXECUTABLE_STEM)));
    }

    #[test]
    fn resolve_backend_executable_is_development_mode_without_resources() {
        let resolved =
            resolve_backend_executable("DBTOOLKIT_TEST_BACKEND_PATH_UNSET", None, |_| {});
        assert_eq!(resolved, None);
    }

    #[test]
    fn resolve_backend_executable_returns_missing_packaged_path_and_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut logs = Vec::new();
        let resolved = resolve_backend_executable(
            "DBTOOLKIT_TEST_BACKEND_PATH_UNSET",
            Some(dir.path()),
            |message| logs.push(message),
        );
        assert_eq!(resolved, Some(packaged_backend_executable(dir.path())));
        assert!(logs.iter().any(|line| line.contains("missing")));
    }

    #[test]
    fn resolve_backend_executable_finds_packaged_file_quietly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let packaged = packaged_backend_executable(dir.path());
        fs::create_dir_all(packaged.parent().expect("parent")).expect("create backend dir");
        fs::write(&packaged, b"").expect("write backend");

        let mut logs = Vec::new();
        let resolved = resolve_backend_executable(
            "DBTOOLKIT_TEST_BACKEND_PATH_UNSET",
            Some(dir.path()),
            |message| logs.push(message),
        );
        assert_eq!(resolved, Some(packaged));
        assert!(logs.is_empty());
    }

    #[test]
    fn resolve_backend_executable_prefers_env_override() {
        let env_name = "DBTOOLKIT_TEST_BACKEND_PATH_OVERRIDE";
        env::set_var(env_name, "/usr/local/bin/custom-backend");
        let resolved = resolve_backend_executable(env_name, Some(Path::new("/opt/app")), |_| {});
        env::remove_var(env_name);
        assert_eq!(resolved, Some(PathBuf::from("/usr/local/bin/custom-backend")));
    }
}
