//! Pattern registry and detector config files
//!
//! A config file looks like:
//!
//! ```json
//! {
//!   "from": "2024-03-01",
//!   "to": "2024-03-07",
//!   "configs": [
//!     { "windowSeconds": 60, "dropPercent": 2, "recordAfterSeconds": 600, "cooldownSeconds": 600 }
//!   ]
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DetectorConfig;

pub const DEFAULT_SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown pattern \"{name}\". Available: {available}")]
    UnknownPattern { name: String, available: String },

    #[error("--from and --to are required (either via CLI or in the config file)")]
    MissingDateRange,

    #[error("invalid date {value:?}, expected YYYY-MM-DD")]
    InvalidDate { value: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Detection patterns known to the backtester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    RapidDrop,
}

impl PatternKind {
    pub const ALL: [PatternKind; 1] = [PatternKind::RapidDrop];

    pub fn name(&self) -> &'static str {
        match self {
            PatternKind::RapidDrop => "rapid-drop",
        }
    }

    /// `configs/<name>.json`
    pub fn default_config_path(&self) -> PathBuf {
        PathBuf::from("configs").join(format!("{}.json", self.name()))
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PatternKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| ConfigError::UnknownPattern {
                name: s.to_string(),
                available: Self::ALL.map(|p| p.name()).join(", "),
            })
    }
}

/// Contents of a pattern config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub configs: Vec<DetectorConfig>,
}

impl PatternConfigFile {
    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.configs.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "at least one detector config is required".to_string(),
            });
        }
        self.configs.iter().try_for_each(validate_config)
    }

    /// Date range with CLI values taking precedence over the file's defaults
    pub fn resolve_range(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<(NaiveDate, NaiveDate), ConfigError> {
        let from = from.or(self.from.as_deref());
        let to = to.or(self.to.as_deref());
        match (from, to) {
            (Some(from), Some(to)) => parse_date_range(from, to),
            _ => Err(ConfigError::MissingDateRange),
        }
    }
}

/// Durations must be positive, the drop threshold strictly between 0 and 100
pub fn validate_config(config: &DetectorConfig) -> Result<(), ConfigError> {
    let invalid = |reason: String| Err(ConfigError::Invalid { reason });

    if config.window_seconds == 0 {
        return invalid(format!("{}: windowSeconds must be > 0", config.label()));
    }
    if config.record_after_seconds == 0 {
        return invalid(format!("{}: recordAfterSeconds must be > 0", config.label()));
    }
    if config.cooldown_seconds == 0 {
        return invalid(format!("{}: cooldownSeconds must be > 0", config.label()));
    }
    if config.drop_percent <= Decimal::ZERO || config.drop_percent >= Decimal::ONE_HUNDRED {
        return invalid(format!("{}: dropPercent must be in (0, 100)", config.label()));
    }
    Ok(())
}

pub fn parse_date(value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| ConfigError::InvalidDate {
        value: value.to_string(),
    })
}

/// Inclusive day range; `from` must not be after `to`
pub fn parse_date_range(from: &str, to: &str) -> Result<(NaiveDate, NaiveDate), ConfigError> {
    let (from, to) = (parse_date(from)?, parse_date(to)?);
    if from > to {
        return Err(ConfigError::Invalid {
            reason: format!("from {from} is after to {to}"),
        });
    }
    Ok((from, to))
}

/// `--symbol` if given (upper-cased), otherwise the default set
pub fn resolve_symbols(symbol: Option<&str>) -> Vec<String> {
    match symbol {
        Some(s) => vec![s.to_uppercase()],
        None => DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"{
        "from": "2024-03-01",
        "to": "2024-03-07",
        "configs": [
            { "windowSeconds": 30, "dropPercent": 2, "recordAfterSeconds": 600, "cooldownSeconds": 600 },
            { "windowSeconds": 300, "dropPercent": 5.5, "recordAfterSeconds": 3600, "cooldownSeconds": 600 }
        ]
    }"#;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_pattern_registry() {
        assert_eq!("rapid-drop".parse::<PatternKind>().unwrap(), PatternKind::RapidDrop);
        assert_eq!(
            PatternKind::RapidDrop.default_config_path(),
            PathBuf::from("configs/rapid-drop.json")
        );

        let err = "head-and-shoulders".parse::<PatternKind>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown pattern \"head-and-shoulders\". Available: rapid-drop"
        );
    }

    #[test]
    fn test_load_sample_file() {
        let file = write_temp(SAMPLE);
        let config = PatternConfigFile::load(file.path()).unwrap();
        assert_eq!(config.configs.len(), 2);
        assert_eq!(config.configs[1].drop_percent, dec!(5.5));
        assert_eq!(config.configs[1].record_after_seconds, 3600);
    }

    #[test]
    fn test_cli_dates_override_file() {
        let config: PatternConfigFile = serde_json::from_str(SAMPLE).unwrap();
        let (from, to) = config.resolve_range(None, Some("2024-03-02")).unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
    }

    #[test]
    fn test_missing_date_range() {
        let config = PatternConfigFile {
            from: None,
            to: Some("2024-03-07".to_string()),
            configs: vec![DetectorConfig::default()],
        };
        assert!(matches!(config.resolve_range(None, None), Err(ConfigError::MissingDateRange)));
        assert!(config.resolve_range(Some("2024-03-01"), None).is_ok());
    }

    #[test]
    fn test_bad_dates_rejected() {
        assert!(matches!(parse_date("03/01/2024"), Err(ConfigError::InvalidDate { .. })));
        assert!(matches!(
            parse_date_range("2024-03-05", "2024-03-01"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let zero_window = DetectorConfig {
            window_seconds: 0,
            ..Default::default()
        };
        assert!(validate_config(&zero_window).is_err());

        let full_drop = DetectorConfig {
            drop_percent: dec!(100),
            ..Default::default()
        };
        assert!(validate_config(&full_drop).is_err());

        let negative = DetectorConfig {
            drop_percent: dec!(-1),
            ..Default::default()
        };
        assert!(validate_config(&negative).is_err());
        assert!(validate_config(&DetectorConfig::default()).is_ok());

        let empty = write_temp(r#"{"configs": []}"#);
        assert!(matches!(PatternConfigFile::load(empty.path()), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_malformed_and_missing_files() {
        let broken = write_temp(r#"{"configs": [{"windowSeconds": "sixty"}]}"#);
        assert!(matches!(PatternConfigFile::load(broken.path()), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            PatternConfigFile::load("/nonexistent/rapid-drop.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_symbols() {
        assert_eq!(resolve_symbols(Some("solusdt")), vec!["SOLUSDT"]);
        assert_eq!(resolve_symbols(None).len(), 3);
    }
}
