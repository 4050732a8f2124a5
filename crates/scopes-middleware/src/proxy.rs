//! Client-side proxies for servants registered with an adapter.

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::debug;

use crate::config::{MiddlewareConfig, RequestMode};
use crate::error::{MiddlewareError, Result};
use crate::protocol::{self, Request, Response};
use crate::servant::ServantBase;
use crate::transport;

/// Run one client exchange to completion on a private runtime.
///
/// Panics if called from within an async context, like any nested
/// `block_on`.
fn block_on<T>(exchange: impl Future<Output = Result<T>>) -> Result<T> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(exchange)
}

/// Send one request and wait for its reply.
///
/// Opens a fresh connection, so at most one request is outstanding on it.
pub fn call(endpoint: &str, request: &Request, timeout: Duration) -> Result<Response> {
    let bytes = protocol::encode_request(request)?;
    block_on(async {
        let mut stream = transport::connect(endpoint).await?;
        transport::write_frame(&mut stream, &bytes).await?;

        let frame = time::timeout(timeout, transport::read_frame(&mut stream))
            .await
            .map_err(|_| MiddlewareError::Timeout {
                operation: format!("invoke {} on {}", request.op_name, endpoint),
                timeout,
            })??
            .ok_or_else(|| {
                MiddlewareError::io(format!(
                    "connection to {} closed before reply to {}",
                    endpoint, request.op_name
                ))
            })?;
        protocol::decode_response(&frame)
    })
}

/// Send one request without waiting for anything back.
pub fn send(endpoint: &str, request: &Request) -> Result<()> {
    let bytes = protocol::encode_request(request)?;
    block_on(async {
        let mut stream = transport::connect(endpoint).await?;
        transport::write_frame(&mut stream, &bytes).await
    })
}

/// Address of a servant: endpoint, identity, category and mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectProxy {
    endpoint: String,
    identity: String,
    category: String,
    mode: RequestMode,
    timeout: Option<Duration>,
}

impl ObjectProxy {
    /// Create a proxy with the default twoway timeout.
    pub fn new(
        endpoint: impl Into<String>,
        identity: impl Into<String>,
        category: impl Into<String>,
        mode: RequestMode,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: identity.into(),
            category: category.into(),
            mode,
            timeout: None,
        }
    }

    /// A proxy that refers to nothing.
    pub fn null() -> Self {
        Self::new("", "", "", RequestMode::Twoway)
    }

    /// Set the reply timeout for twoway invocations.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// True for a proxy created by [`ObjectProxy::null`].
    pub fn is_null(&self) -> bool {
        self.endpoint.is_empty()
    }

    /// Endpoint of the adapter that hosts the servant.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identity the servant is registered under.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Category used to pick a default servant. May be empty.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Request mode of the hosting adapter.
    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    /// Explicit twoway timeout, if one was set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn check_not_null(&self, op_name: &str) -> Result<()> {
        if self.is_null() {
            return Err(MiddlewareError::invalid_argument(format!(
                "invoke(): cannot invoke {} on null proxy",
                op_name
            )));
        }
        Ok(())
    }

    /// Invoke `op_name` and wait for its result.
    ///
    /// Remote runtime exceptions come back as `Unknown`, `ObjectNotExist`
    /// or `OperationNotExist` errors.
    pub fn invoke_twoway(&self, op_name: &str, in_params: Value) -> Result<Value> {
        self.check_not_null(op_name)?;
        let request = Request::new(&self.identity, &self.category, op_name, RequestMode::Twoway, in_params);
        let timeout = self.timeout.unwrap_or(MiddlewareConfig::DEFAULT_TWOWAY_TIMEOUT);
        debug!("Invoking {} on {}", op_name, self);
        call(&self.endpoint, &request, timeout)?.into_result()
    }

    /// Invoke `op_name` without waiting for the servant to run.
    pub fn invoke_oneway(&self, op_name: &str, in_params: Value) -> Result<()> {
        self.check_not_null(op_name)?;
        let request = Request::new(&self.identity, &self.category, op_name, RequestMode::Oneway, in_params);
        send(&self.endpoint, &request)
    }

    /// Check that the servant is reachable.
    pub fn ping(&self) -> Result<()> {
        self.invoke_twoway(ServantBase::PING, Value::Null).map(|_| ())
    }
}

impl fmt::Display for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("nullproxy:");
        }
        write!(f, "{}#{}", self.endpoint, self.identity)?;
        if !self.category.is_empty() {
            write!(f, "!c={}", self.category)?;
        }
        write!(f, "!m={}", self.mode.as_char())?;
        if let Some(timeout) = self.timeout {
            write!(f, "!t={}", timeout.as_millis())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_proxy_to_string() {
        let proxy = ObjectProxy::new("ipc:///tmp/scope", "fred", "", RequestMode::Twoway);
        assert_eq!(proxy.to_string(), "ipc:///tmp/scope#fred!m=t");

        let proxy = ObjectProxy::new("ipc:///tmp/scope", "fred", "reg", RequestMode::Oneway)
            .with_timeout(Duration::from_millis(500));
        assert_eq!(proxy.to_string(), "ipc:///tmp/scope#fred!c=reg!m=o!t=500");
    }

    #[test]
    fn test_null_proxy() {
        let proxy = ObjectProxy::null();
        assert!(proxy.is_null());
        assert_eq!(proxy.to_string(), "nullproxy:");
        assert!(matches!(
            proxy.invoke_twoway("ping", json!(null)),
            Err(MiddlewareError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_invoke_without_listener_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let endpoint = transport::endpoint_for(&dir.path().join("nobody.sock"));
        let proxy = ObjectProxy::new(endpoint, "fred", "", RequestMode::Twoway);
        assert!(matches!(proxy.ping(), Err(MiddlewareError::Io { .. })));
    }

    #[test]
    fn test_twoway_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("silent.sock");
        // Accepts connections but never answers.
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let proxy = ObjectProxy::new(transport::endpoint_for(&path), "fred", "", RequestMode::Twoway)
            .with_timeout(Duration::from_millis(100));
        match proxy.ping() {
            Err(MiddlewareError::Timeout { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(100))
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
