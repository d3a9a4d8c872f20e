//! Cross-platform application paths

use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, String> {
        let data_dir = Self::get_data_dir()?;

        for dir in [data_dir.clone(), data_dir.join("datasets"), data_dir.join("models")] {
            fs::create_dir_all(&dir)
                .map_err(|e| format!("Failed to create directory {:?}: {}", dir, e))?;
        }

        Ok(Self { data_dir })
    }

    fn get_data_dir() -> Result<PathBuf, String> {
        if let Ok(dir) = std::env::var("NEUROFEED_DATA_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let base = dirs::data_dir().ok_or("Could not determine data directory")?;
        Ok(base.join("neurofeed"))
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.data_dir.join("datasets")
    }

    /// Default model directory; `Optimize`/`Execute` may name another.
    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }
}
