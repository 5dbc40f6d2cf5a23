// ABOUTME: Default on-disk locations for the corral host when corral.toml does not name them.
// ABOUTME: Config lookup order lives here so the CLI and the loader agree on it.

use directories::ProjectDirs;
use std::path::PathBuf;

/// Name of the host configuration file
pub const CONFIG_FILE_NAME: &str = "corral.toml";

fn platform_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "2389", "corral")
}

/// Root for sessions.db, group folders and IPC mailboxes unless `[paths] data_dir` overrides it.
///
/// Hosts without a resolvable home directory (bare containers, some CI runners)
/// get `./data` under the working directory.
pub fn data_dir() -> PathBuf {
    match platform_dirs() {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => PathBuf::from("./data"),
    }
}

/// Where `--log-file` writes the rolling host log
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Config files tried when `CORRAL_CONFIG_PATH` is unset, first match wins
pub fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(dirs) = platform_dirs() {
        candidates.push(dirs.config_dir().join(CONFIG_FILE_NAME));
    }
    candidates
}
