//! Configuration for object adapters.
//!
//! Transport-wide constants live on [`MiddlewareConfig`]; per-adapter settings
//! are plain values on [`AdapterConfig`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{MiddlewareError, Result};

/// Transport and protocol constants.
pub struct MiddlewareConfig;

impl MiddlewareConfig {
    /// Scheme prefix accepted for endpoints.
    pub const ENDPOINT_SCHEME: &'static str = "ipc://";
    /// Largest frame accepted on any connection.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// How long the broker keeps flushing replies after it stops.
    pub const LINGER: Duration = Duration::from_secs(1);
    /// Reply timeout for proxies that do not set one.
    pub const DEFAULT_TWOWAY_TIMEOUT: Duration = Duration::from_secs(30);
    /// Timeout for establishing a client connection.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default number of worker threads per adapter.
    pub const DEFAULT_POOL_SIZE: usize = 1;
}

/// Whether requests expect a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    Oneway,
    Twoway,
}

impl RequestMode {
    /// Single-letter form used in stringified proxies.
    pub fn as_char(self) -> char {
        match self {
            RequestMode::Oneway => 'o',
            RequestMode::Twoway => 't',
        }
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestMode::Oneway => write!(f, "oneway"),
            RequestMode::Twoway => write!(f, "twoway"),
        }
    }
}

/// Settings for one object adapter.
///
/// # Example
///
/// ```
/// use scopes_middleware::{AdapterConfig, RequestMode};
/// use std::time::Duration;
///
/// let config = AdapterConfig::new("testscope", "ipc:///tmp/testscope", RequestMode::Twoway)
///     .pool_size(4)
///     .idle_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Adapter name, used in diagnostics and thread names.
    pub name: String,
    /// Public endpoint, `ipc://<socket path>`.
    pub endpoint: String,
    /// Mode every request must match.
    pub mode: RequestMode,
    /// Number of worker threads.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Shut the adapter down after this long without traffic.
    #[serde(default, with = "optional_millis")]
    pub idle_timeout: Option<Duration>,
}

fn default_pool_size() -> usize {
    MiddlewareConfig::DEFAULT_POOL_SIZE
}

impl AdapterConfig {
    /// Create a config with one worker and no idle timeout.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, mode: RequestMode) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            mode,
            pool_size: MiddlewareConfig::DEFAULT_POOL_SIZE,
            idle_timeout: None,
        }
    }

    /// Set the number of worker threads.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Enable idle eviction.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Check that the config describes a usable adapter.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MiddlewareError::invalid_argument(
                "ObjectAdapter(): invalid empty adapter name",
            ));
        }
        if self.pool_size < 1 {
            return Err(MiddlewareError::invalid_argument(format!(
                "ObjectAdapter(): invalid pool size {} (adapter: {})",
                self.pool_size, self.name
            )));
        }
        crate::transport::socket_path(&self.endpoint)?;
        Ok(())
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = AdapterConfig::new("testscope", "ipc:///tmp/x", RequestMode::Oneway);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.idle_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty_name = AdapterConfig::new("", "ipc:///tmp/x", RequestMode::Twoway);
        assert!(matches!(
            empty_name.validate(),
            Err(MiddlewareError::InvalidArgument { .. })
        ));

        let no_workers = AdapterConfig::new("a", "ipc:///tmp/x", RequestMode::Twoway).pool_size(0);
        let err = no_workers.validate().unwrap_err();
        assert!(err.to_string().contains("invalid pool size 0"));

        let bad_endpoint = AdapterConfig::new("a", "tcp://localhost:5555", RequestMode::Twoway);
        assert!(bad_endpoint.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: AdapterConfig = serde_json::from_str(
            r#"{"name": "testscope", "endpoint": "ipc:///tmp/s", "mode": "twoway", "idle_timeout": 250}"#,
        )
        .unwrap();
        assert_eq!(config.mode, RequestMode::Twoway);
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(RequestMode::Oneway.to_string(), "oneway");
        assert_eq!(RequestMode::Twoway.as_char(), 't');
    }
}
