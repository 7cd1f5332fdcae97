use super::BrokerConfig;
use crate::Result;
use config::{Config, Environment};

impl BrokerConfig {
    /// Load overrides from `WARREN_*` environment variables, e.g.
    /// `WARREN_PORT=5673` or `WARREN_DATA_DIR=/var/lib/warren`.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("WARREN").try_parsing(true))
            .build()
            .map_err(|e| crate::WarrenError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| crate::WarrenError::Config(e.to_string()))?;

        config.validate().map_err(crate::WarrenError::Config)?;
        Ok(config)
    }
}
