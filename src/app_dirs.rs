use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    /// `$HOME/.local/state/evolv`, or the platform data-local dir
    pub fn state_dir() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            Some(
                PathBuf::from(home)
                    .join(".local")
                    .join("state")
                    .join("evolv"),
            )
        } else {
            ProjectDirs::from("", "", "evolv").map(|proj_dirs| proj_dirs.data_local_dir().into())
        }
    }

    pub fn db_path() -> Option<PathBuf> {
        Self::state_dir().map(|dir| dir.join("state.db"))
    }

    pub fn log_dir() -> Option<PathBuf> {
        Self::state_dir().map(|dir| dir.join("logs"))
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "evolv").map(|pd| pd.config_dir().join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_and_logs_share_the_state_dir() {
        if let (Some(db), Some(logs), Some(state)) =
            (AppDirs::db_path(), AppDirs::log_dir(), AppDirs::state_dir())
        {
            assert_eq!(db.parent(), Some(state.as_path()));
            assert_eq!(logs.parent(), Some(state.as_path()));
            assert!(db.ends_with("state.db"));
        }
    }
}
