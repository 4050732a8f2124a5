//! Request and response messages exchanged between proxies and adapters.
//!
//! Messages are JSON documents carried in a single transport frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RequestMode;
use crate::error::{MiddlewareError, Result};

/// Mode as it appears on the wire. Unrecognised values decode to `Invalid`
/// so the worker can reject the header instead of failing to decode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMode {
    Oneway,
    Twoway,
    #[default]
    #[serde(other)]
    Invalid,
}

impl From<RequestMode> for WireMode {
    fn from(mode: RequestMode) -> Self {
        match mode {
            RequestMode::Oneway => WireMode::Oneway,
            RequestMode::Twoway => WireMode::Twoway,
        }
    }
}

/// An invocation of one operation on one servant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cat: String,
    #[serde(default)]
    pub op_name: String,
    #[serde(default)]
    pub mode: WireMode,
    #[serde(default)]
    pub in_params: Value,
}

impl Request {
    pub fn new(
        id: impl Into<String>,
        cat: impl Into<String>,
        op_name: impl Into<String>,
        mode: RequestMode,
        in_params: Value,
    ) -> Self {
        Self {
            id: id.into(),
            cat: cat.into(),
            op_name: op_name.into(),
            mode: mode.into(),
            in_params,
        }
    }

    /// Identity and operation are present and the mode is one we know.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && !self.op_name.is_empty() && self.mode != WireMode::Invalid
    }
}

/// Address of a servant as reported in error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub endpoint: String,
    pub identity: String,
    #[serde(default)]
    pub category: String,
}

/// Structured failure returned to a twoway caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeException {
    Unknown {
        message: String,
    },
    ObjectNotExist {
        proxy: ProxyInfo,
        adapter: String,
    },
    OperationNotExist {
        proxy: ProxyInfo,
        adapter: String,
        op_name: String,
    },
}

impl From<RuntimeException> for MiddlewareError {
    fn from(exception: RuntimeException) -> Self {
        match exception {
            RuntimeException::Unknown { message } => MiddlewareError::Unknown { message },
            RuntimeException::ObjectNotExist { proxy, adapter } => MiddlewareError::ObjectNotExist {
                endpoint: proxy.endpoint,
                identity: proxy.identity,
                category: proxy.category,
                adapter,
            },
            RuntimeException::OperationNotExist {
                proxy,
                adapter,
                op_name,
            } => MiddlewareError::OperationNotExist {
                endpoint: proxy.endpoint,
                identity: proxy.identity,
                category: proxy.category,
                adapter,
                op_name,
            },
        }
    }
}

/// Reply to a twoway request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum Response {
    Success(Value),
    RuntimeException(RuntimeException),
}

impl Response {
    pub fn success(payload: Value) -> Self {
        Response::Success(payload)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Response::RuntimeException(RuntimeException::Unknown {
            message: message.into(),
        })
    }

    pub fn object_not_exist(endpoint: &str, identity: &str, category: &str, adapter: &str) -> Self {
        Response::RuntimeException(RuntimeException::ObjectNotExist {
            proxy: ProxyInfo {
                endpoint: endpoint.to_string(),
                identity: identity.to_string(),
                category: category.to_string(),
            },
            adapter: adapter.to_string(),
        })
    }

    pub fn operation_not_exist(
        endpoint: &str,
        identity: &str,
        category: &str,
        adapter: &str,
        op_name: &str,
    ) -> Self {
        Response::RuntimeException(RuntimeException::OperationNotExist {
            proxy: ProxyInfo {
                endpoint: endpoint.to_string(),
                identity: identity.to_string(),
                category: category.to_string(),
            },
            adapter: adapter.to_string(),
            op_name: op_name.to_string(),
        })
    }

    /// Turn the response into the success payload or the remote error.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Response::Success(payload) => Ok(payload),
            Response::RuntimeException(e) => Err(e.into()),
        }
    }
}

/// Serialize a request frame.
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

/// Parse a request frame.
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize a response frame.
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}

/// Parse a response frame.
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new("some_id", "", "success_op", RequestMode::Twoway, json!({"a": 1}));
        let value: Value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], "some_id");
        assert_eq!(value["op_name"], "success_op");
        assert_eq!(value["mode"], "twoway");
        assert_eq!(value["in_params"]["a"], 1);
    }

    #[test]
    fn test_request_missing_fields_decode_as_empty() {
        let request = decode_request(br#"{"mode": "twoway"}"#).unwrap();
        assert!(request.id.is_empty());
        assert!(request.op_name.is_empty());
        assert!(!request.is_well_formed());
    }

    #[test]
    fn test_request_unknown_mode_is_invalid() {
        let request = decode_request(br#"{"id": "x", "op_name": "y", "mode": "sideways"}"#).unwrap();
        assert_eq!(request.mode, WireMode::Invalid);
        assert!(!request.is_well_formed());
    }

    #[test]
    fn test_request_garbage_fails_to_decode() {
        assert!(decode_request(b"\x00\x01not json").is_err());
        assert!(decode_request(b"[1, 2, 3]").is_err());
    }

    #[test]
    fn test_response_success_serialization() {
        let bytes = encode_response(&Response::success(json!("ok"))).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"status": "success", "payload": "ok"}));
    }

    #[test]
    fn test_operation_not_exist_into_error() {
        let response = Response::operation_not_exist("ipc://e", "some_id", "", "testscope", "nope");
        let bytes = encode_response(&response).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "runtime_exception");
        assert_eq!(value["payload"]["kind"], "operation_not_exist");

        match decode_response(&bytes).unwrap().into_result() {
            Err(MiddlewareError::OperationNotExist { op_name, adapter, .. }) => {
                assert_eq!(op_name, "nope");
                assert_eq!(adapter, "testscope");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
