pub mod check;
pub mod clean;
pub mod dump;
pub mod history;

use std::path::PathBuf;

use barrow::{Config, ConfigError};

/// Where configurations are read from and state is kept.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_root: PathBuf,
    pub var_dir: PathBuf,
}

impl Paths {
    pub fn load(&self, name: &str) -> Result<Config, ConfigError> {
        Config::load(&self.config_root, &self.var_dir, name)
    }
}

pub type CommandResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
