use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::storage::{ArchivePeriod, ConnectionParams, Error, Result, TableNames};

const SQLITE: &str = "sqlite";

fn default_backend() -> String {
    SQLITE.to_string()
}

fn default_archive_period() -> String {
    "7d".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConnectionConfig {
    #[serde(rename = "type", default = "default_backend")]
    pub backend: String,
    pub params: ConnectionParams,
}

/// Historian agent configuration
#[derive(Clone, Debug, Deserialize)]
pub struct HistorianConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub tables_def: TableNames,
    /// `<integer><unit>`; `m` minutes, `h` hours, `d` days, `w` weeks, `M` months
    #[serde(default = "default_archive_period")]
    pub archive_period: String,
    /// Seconds between maintenance runs on the writer thread
    #[serde(default)]
    pub maintenance_interval: Option<u64>,
}

impl HistorianConfig {
    pub fn new(database: impl Into<PathBuf>, archive_period: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig {
                backend: default_backend(),
                params: ConnectionParams::new(database),
            },
            tables_def: TableNames::default(),
            archive_period: archive_period.into(),
            maintenance_interval: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HistorianConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn archive_period(&self) -> Result<ArchivePeriod> {
        ArchivePeriod::parse(&self.archive_period)
    }

    pub fn maintenance_interval(&self) -> Option<Duration> {
        self.maintenance_interval.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.backend != SQLITE {
            return Err(Error::InvalidConfiguration(format!(
                "Unsupported connection type: {:?}",
                self.connection.backend
            )));
        }
        if self.maintenance_interval == Some(0) {
            return Err(Error::InvalidConfiguration(
                "maintenance_interval must be at least one second".to_string(),
            ));
        }
        self.tables_def.validate()?;
        self.archive_period()?;
        Ok(())
    }
}
