//! Servants: the objects that implement remote operations.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::protocol::Response;

/// Context of the invocation being dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Current {
    pub adapter: String,
    pub endpoint: String,
    pub id: String,
    pub category: String,
    pub op_name: String,
}

/// Failure reported by a servant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The servant has no operation with the requested name.
    OperationNotExist,
    /// The operation ran and failed.
    Failed(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::OperationNotExist => write!(f, "operation does not exist"),
            DispatchError::Failed(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Target of remote invocations.
///
/// Implementations are shared across worker threads and may be invoked
/// concurrently. A servant stays alive for the duration of any in-flight
/// dispatch even if it is removed from its adapter meanwhile.
pub trait Servant: Send + Sync {
    fn dispatch(&self, current: &Current, in_params: &Value) -> Result<Value, DispatchError>;
}

/// Handler for one operation of a [`ServantBase`].
pub type OperationHandler = Box<dyn Fn(&Current, &Value) -> Result<Value, DispatchError> + Send + Sync>;

/// Servant built from a table of named operations.
///
/// Every `ServantBase` answers `ping`.
///
/// # Example
///
/// ```
/// use scopes_middleware::servant::ServantBase;
/// use serde_json::json;
///
/// let servant = ServantBase::new()
///     .operation("success_op", |_current, _params| Ok(json!(null)));
/// assert!(servant.has_operation("success_op"));
/// assert!(servant.has_operation("ping"));
/// ```
pub struct ServantBase {
    operations: HashMap<String, OperationHandler>,
}

impl Default for ServantBase {
    fn default() -> Self {
        Self::new()
    }
}

impl ServantBase {
    pub const PING: &'static str = "ping";

    pub fn new() -> Self {
        let mut operations: HashMap<String, OperationHandler> = HashMap::new();
        operations.insert(Self::PING.to_string(), Box::new(|_: &Current, _: &Value| Ok(Value::Null)));
        Self { operations }
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn operation<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Current, &Value) -> Result<Value, DispatchError> + Send + Sync + 'static,
    {
        self.operations.insert(name.into(), Box::new(handler));
        self
    }

    pub fn has_operation(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }
}

impl Servant for ServantBase {
    fn dispatch(&self, current: &Current, in_params: &Value) -> Result<Value, DispatchError> {
        match self.operations.get(&current.op_name) {
            Some(handler) => handler(current, in_params),
            None => Err(DispatchError::OperationNotExist),
        }
    }
}

/// Invoke a servant and turn every outcome into a response.
///
/// Panics raised by servant code are caught here so a misbehaving servant
/// cannot take down the worker that runs it.
pub(crate) fn safe_dispatch(servant: &Arc<dyn Servant>, current: &Current, in_params: &Value) -> Response {
    let result = panic::catch_unwind(AssertUnwindSafe(|| servant.dispatch(current, in_params)));
    match result {
        Ok(Ok(payload)) => Response::success(payload),
        Ok(Err(DispatchError::OperationNotExist)) => Response::operation_not_exist(
            &current.endpoint,
            &current.id,
            &current.category,
            &current.adapter,
            &current.op_name,
        ),
        Ok(Err(DispatchError::Failed(message))) => Response::unknown(message),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned());
            match detail {
                Some(detail) => Response::unknown(format!("unknown exception: {}", detail)),
                None => Response::unknown("unknown exception"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RuntimeException;
    use serde_json::json;

    fn current(op: &str) -> Current {
        Current {
            adapter: "testscope".into(),
            endpoint: "ipc:///tmp/testscope".into(),
            id: "some_id".into(),
            category: String::new(),
            op_name: op.into(),
        }
    }

    fn servant() -> Arc<dyn Servant> {
        Arc::new(
            ServantBase::new()
                .operation("success_op", |_, _| Ok(json!("ok")))
                .operation("echo", |_, params| Ok(params.clone()))
                .operation("fail_op", |_, _| Err(DispatchError::Failed("bad things".into())))
                .operation("panic_op", |_, _| panic!("servant blew up")),
        )
    }

    #[test]
    fn test_dispatch_success() {
        let response = safe_dispatch(&servant(), &current("echo"), &json!({"x": 1}));
        assert_eq!(response, Response::success(json!({"x": 1})));
    }

    #[test]
    fn test_builtin_ping() {
        let response = safe_dispatch(&servant(), &current("ping"), &Value::Null);
        assert_eq!(response, Response::success(Value::Null));
    }

    #[test]
    fn test_unknown_operation() {
        match safe_dispatch(&servant(), &current("nope"), &Value::Null) {
            Response::RuntimeException(RuntimeException::OperationNotExist { op_name, adapter, proxy }) => {
                assert_eq!(op_name, "nope");
                assert_eq!(adapter, "testscope");
                assert_eq!(proxy.identity, "some_id");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_failure_becomes_unknown() {
        let response = safe_dispatch(&servant(), &current("fail_op"), &Value::Null);
        assert_eq!(response, Response::unknown("bad things"));
    }

    #[test]
    fn test_panic_is_contained() {
        let response = safe_dispatch(&servant(), &current("panic_op"), &Value::Null);
        assert_eq!(response, Response::unknown("unknown exception: servant blew up"));
    }
}
