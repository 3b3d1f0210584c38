use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_COLLECTION: &str = "auctions";
pub const DEFAULT_BID_FLOOR: f64 = 0.0;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_DB_FILENAME: &str = "auctions.db";
pub const DEFAULT_FIRESTORE_DATABASE: &str = "(default)";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const MIN_TICK_INTERVAL_MS: u64 = 100;
pub const MAX_TICK_INTERVAL_MS: u64 = 5_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 250;
pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
    Firestore,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Firestore => "firestore",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "firestore" => Ok(Self::Firestore),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported store backend '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigArgs {
    pub backend: Option<StoreBackend>,
    pub collection: Option<String>,
    pub bid_floor: Option<f64>,
    pub tick_interval_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub db_filename: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub firestore_project_id: Option<String>,
    pub firestore_api_key: Option<String>,
    pub firestore_database: Option<String>,
    pub seed_demo_data: Option<bool>,
    pub log_json: Option<bool>,
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    pub api_key: Option<String>,
    pub database: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend: StoreBackend,
    pub collection: String,
    pub bid_floor: f64,
    pub tick_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub db_filename: String,
    pub data_dir: PathBuf,
    pub firestore: Option<FirestoreConfig>,
    pub seed_demo_data: bool,
    pub log_json: bool,
    pub log_filter: String,
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env_value(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::InvalidArgument(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, AppError> {
    match env_value(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(AppError::InvalidArgument(format!(
                "{key} must be a boolean, got '{raw}'"
            ))),
        },
        None => Ok(None),
    }
}

fn trimmed_non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl ClientConfigArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            backend: env_value("AUCTION_BACKEND")
                .map(|raw| StoreBackend::parse_str(&raw))
                .transpose()?,
            collection: env_value("AUCTION_COLLECTION"),
            bid_floor: env_parsed("AUCTION_BID_FLOOR")?,
            tick_interval_ms: env_parsed("AUCTION_TICK_INTERVAL_MS")?,
            poll_interval_ms: env_parsed("AUCTION_POLL_INTERVAL_MS")?,
            db_filename: env_value("AUCTION_DB_FILENAME"),
            data_dir: env_value("AUCTION_DATA_DIR").map(PathBuf::from),
            firestore_project_id: env_value("AUCTION_FIRESTORE_PROJECT_ID"),
            firestore_api_key: env_value("AUCTION_FIRESTORE_API_KEY"),
            firestore_database: env_value("AUCTION_FIRESTORE_DATABASE"),
            seed_demo_data: env_bool("AUCTION_SEED_DEMO_DATA")?,
            log_json: env_bool("AUCTION_LOG_JSON")?,
            log_filter: env_value("AUCTION_LOG"),
        })
    }

    pub fn normalize(self) -> Result<ClientConfig, AppError> {
        let backend = self.backend.unwrap_or(StoreBackend::Memory);

        let collection = trimmed_non_empty(self.collection)
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string());
        if !collection
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            return Err(AppError::InvalidArgument(
                "collection must be alphanumeric ASCII, '_' or '-'".to_string(),
            ));
        }

        let bid_floor = self.bid_floor.unwrap_or(DEFAULT_BID_FLOOR);
        if !bid_floor.is_finite() || bid_floor < 0.0 {
            return Err(AppError::InvalidArgument(
                "bidFloor must be a finite non-negative number".to_string(),
            ));
        }

        let tick_interval_ms = self.tick_interval_ms.unwrap_or(DEFAULT_TICK_INTERVAL_MS);
        if !(MIN_TICK_INTERVAL_MS..=MAX_TICK_INTERVAL_MS).contains(&tick_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "tickIntervalMs must be between {MIN_TICK_INTERVAL_MS} and {MAX_TICK_INTERVAL_MS}"
            )));
        }

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&poll_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "pollIntervalMs must be between {MIN_POLL_INTERVAL_MS} and {MAX_POLL_INTERVAL_MS}"
            )));
        }

        let db_filename = trimmed_non_empty(self.db_filename)
            .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string());
        let data_dir = self.data_dir.unwrap_or_else(std::env::temp_dir);

        let firestore = match trimmed_non_empty(self.firestore_project_id) {
            Some(project_id) => Some(FirestoreConfig {
                project_id,
                api_key: trimmed_non_empty(self.firestore_api_key),
                database: trimmed_non_empty(self.firestore_database)
                    .unwrap_or_else(|| DEFAULT_FIRESTORE_DATABASE.to_string()),
            }),
            None => None,
        };
        if backend == StoreBackend::Firestore && firestore.is_none() {
            return Err(AppError::InvalidArgument(
                "firestoreProjectId is required for the firestore backend".to_string(),
            ));
        }

        let seed_demo_data = self
            .seed_demo_data
            .unwrap_or(backend == StoreBackend::Memory);
        let log_json = self.log_json.unwrap_or(false);
        let log_filter =
            trimmed_non_empty(self.log_filter).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(ClientConfig {
            backend,
            collection,
            bid_floor,
            tick_interval_ms,
            poll_interval_ms,
            db_filename,
            data_dir,
            firestore,
            seed_demo_data,
            log_json,
            log_filter,
        })
    }
}

impl ClientConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_filename)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            collection: DEFAULT_COLLECTION.to_string(),
            bid_floor: DEFAULT_BID_FLOOR,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            db_filename: DEFAULT_DB_FILENAME.to_string(),
            data_dir: std::env::temp_dir(),
            firestore: None,
            seed_demo_data: false,
            log_json: false,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_defaults() {
        let config = ClientConfigArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.collection, DEFAULT_COLLECTION);
        assert_eq!(config.bid_floor, DEFAULT_BID_FLOOR);
        assert_eq!(config.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.db_filename, DEFAULT_DB_FILENAME);
        assert!(config.firestore.is_none());
        assert!(config.seed_demo_data);
        assert!(!config.log_json);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn rejects_negative_bid_floor() {
        let result = ClientConfigArgs {
            bid_floor: Some(-1.0),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_tick_interval_range() {
        let result = ClientConfigArgs {
            tick_interval_ms: Some(10),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_poll_interval_range() {
        let result = ClientConfigArgs {
            poll_interval_ms: Some(120_000),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_collection_with_path_separators() {
        let result = ClientConfigArgs {
            collection: Some("auctions/../users".to_string()),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn firestore_backend_requires_project_id() {
        let missing = ClientConfigArgs {
            backend: Some(StoreBackend::Firestore),
            ..Default::default()
        }
        .normalize();
        assert!(missing.is_err());

        let config = ClientConfigArgs {
            backend: Some(StoreBackend::Firestore),
            firestore_project_id: Some("  harvesthub-1cf29 ".to_string()),
            firestore_api_key: Some("   ".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("project id should be enough");

        let firestore = config.firestore.expect("firestore config should be set");
        assert_eq!(firestore.project_id, "harvesthub-1cf29");
        assert_eq!(firestore.api_key, None);
        assert_eq!(firestore.database, DEFAULT_FIRESTORE_DATABASE);
        assert!(!config.seed_demo_data);
    }

    #[test]
    fn parses_backend_names_case_insensitively() {
        assert_eq!(
            StoreBackend::parse_str(" SQLite ").expect("sqlite should parse"),
            StoreBackend::Sqlite
        );
        assert!(StoreBackend::parse_str("redis").is_err());
    }
}
