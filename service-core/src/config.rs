//! Settings common to every service process.

use crate::error::AppError;
use serde::Deserialize;

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP port; `0` binds an ephemeral port (tests).
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Config {
    /// Load from the process environment (`PORT`).
    pub fn load() -> Result<Self, AppError> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let config = settings.try_deserialize::<Config>()?;
        Ok(config)
    }
}
