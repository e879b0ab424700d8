//! Connection and consumer settings.
//!
//! All structs deserialize with serde and fall back to defaults for missing fields, so an
//! application can load them from whatever configuration source it already uses.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Default table (or collection) holding the jobs.
pub const DEFAULT_TABLE_NAME: &str = "jobs";

/// Default lease taken by a reservation: 5 minutes.
pub const DEFAULT_LEASE_SECONDS: u32 = 5 * 60;

const MAX_TABLE_NAME_LEN: usize = 63;

/// Settings used by [`Queue::connect`](crate::Queue::connect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Store location. The scheme picks the backend: `mongodb://`, `mongodb+srv://`,
    /// `postgres://`, `postgresql://` or `memory://`.
    pub url: String,
    pub table_name: String,
    /// CA file used for TLS connections to MongoDB.
    pub cert_file: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            cert_file: None,
        }
    }
}

impl QueueConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    pub fn with_cert_file(mut self, cert_file: impl Into<String>) -> Self {
        self.cert_file = Some(cert_file.into());
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        validate_table_name(&self.table_name)
    }
}

/// Checks that `name` is safe to use as a table identifier.
pub fn validate_table_name(name: &str) -> Result<(), QueueError> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_TABLE_NAME_LEN {
        return Err(QueueError::InvalidConfig(format!(
            "table_name {name:?} must match [A-Za-z_][A-Za-z0-9_]* and be at most {MAX_TABLE_NAME_LEN} characters"
        )));
    }

    Ok(())
}

/// Options for a single reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    pub lease_seconds: u32,
    /// Upper bound on the number of jobs claimed by the call.
    pub max_count: usize,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            lease_seconds: DEFAULT_LEASE_SECONDS,
            max_count: 1,
        }
    }
}

impl ConsumeOptions {
    pub fn with_lease_seconds(mut self, lease_seconds: u32) -> Self {
        self.lease_seconds = lease_seconds;
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.lease_seconds == 0 {
            return Err(QueueError::InvalidConfig(
                "lease_seconds must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Options for [`Queue::listen`](crate::Queue::listen).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Time between two polls of the store.
    pub interval_ms: u64,
    pub lease_seconds: u32,
    /// Ceiling on jobs dispatched but not yet acknowledged.
    pub max_outstanding: usize,
    /// Optional cap on the jobs reserved by a single poll.
    pub max_per_tick: Option<usize>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            max_outstanding: 1,
            max_per_tick: None,
        }
    }
}

impl ListenOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lease_seconds(mut self, lease_seconds: u32) -> Self {
        self.lease_seconds = lease_seconds;
        self
    }

    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }

    pub fn with_max_per_tick(mut self, max_per_tick: usize) -> Self {
        self.max_per_tick = Some(max_per_tick);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Number of jobs a tick may request given how many are still outstanding.
    pub fn capacity(&self, outstanding: usize) -> usize {
        let available = self.max_outstanding.saturating_sub(outstanding);
        match self.max_per_tick {
            Some(cap) => available.min(cap),
            None => available,
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.interval_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "interval_ms must be greater than 0".into(),
            ));
        }
        if self.max_outstanding == 0 {
            return Err(QueueError::InvalidConfig(
                "max_outstanding must be greater than 0".into(),
            ));
        }
        if self.max_per_tick == Some(0) {
            return Err(QueueError::InvalidConfig(
                "max_per_tick must be greater than 0".into(),
            ));
        }
        ConsumeOptions::default()
            .with_lease_seconds(self.lease_seconds)
            .validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let consume = ConsumeOptions::default();
        assert_eq!(consume.lease_seconds, 300);
        assert_eq!(consume.max_count, 1);

        let config = QueueConfig::default();
        assert_eq!(config.table_name, "jobs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(validate_table_name("t2").is_ok());
        assert!(validate_table_name("_jobs_v2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2jobs").is_err());
        assert!(validate_table_name("jobs; DROP TABLE jobs").is_err());
        assert!(validate_table_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn capacity_is_ceiling_minus_outstanding() {
        let options = ListenOptions::default().with_max_outstanding(5);
        assert_eq!(options.capacity(0), 5);
        assert_eq!(options.capacity(3), 2);
        assert_eq!(options.capacity(5), 0);
        assert_eq!(options.capacity(7), 0);
    }

    #[test]
    fn capacity_respects_per_tick_cap() {
        let options = ListenOptions::default()
            .with_max_outstanding(10)
            .with_max_per_tick(3);
        assert_eq!(options.capacity(0), 3);
        assert_eq!(options.capacity(8), 2);
    }

    #[test]
    fn listen_options_reject_zero_values() {
        let zero_interval = ListenOptions {
            interval_ms: 0,
            ..ListenOptions::default()
        };
        assert!(zero_interval.validate().is_err());

        let zero_ceiling = ListenOptions::default().with_max_outstanding(0);
        assert!(zero_ceiling.validate().is_err());

        let zero_cap = ListenOptions::default().with_max_per_tick(0);
        assert!(zero_cap.validate().is_err());

        let zero_lease = ListenOptions::default().with_lease_seconds(0);
        match zero_lease.validate() {
            Err(e) => assert!(e.to_string().contains("lease_seconds must be greater than 0")),
            Ok(_) => panic!("Expected error for zero lease"),
        }
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"url":"postgres://localhost/app","table_name":"t2"}"#)
                .unwrap();
        assert_eq!(config.table_name, "t2");
        assert_eq!(config.cert_file, None);

        let listen: ListenOptions = serde_json::from_str(r#"{"max_outstanding":4}"#).unwrap();
        assert_eq!(listen.max_outstanding, 4);
        assert_eq!(listen.interval(), Duration::from_secs(1));
    }
}
