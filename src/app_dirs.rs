use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    pub fn config_path() -> PathBuf {
        if let Some(pd) = ProjectDirs::from("", "", "updown") {
            pd.config_dir().join("config.json")
        } else {
            PathBuf::from("updown_config.json")
        }
    }
}
