//! Scopes Middleware - object adapters for invoking scope plugins over local
//! sockets.
//!
//! An [`ObjectAdapter`] owns one `ipc://` endpoint, a registry of servants
//! keyed by identity (with optional per-category defaults), a broker thread
//! and a fixed pool of worker threads. Clients reach a servant through an
//! [`ObjectProxy`] with either twoway (request/reply) or oneway invocations.
//!
//! # Example
//!
//! ```rust,no_run
//! use scopes_middleware::{AdapterConfig, ObjectAdapter, RequestMode, ServantBase};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! fn main() -> scopes_middleware::Result<()> {
//!     let config = AdapterConfig::new("testscope", "ipc:///tmp/testscope", RequestMode::Twoway);
//!     let adapter = ObjectAdapter::new(config)?;
//!
//!     let servant = ServantBase::new().operation("greet", |_, params| {
//!         Ok(json!(format!("hello {}", params)))
//!     });
//!     let proxy = adapter.add("greeter", Arc::new(servant))?;
//!     adapter.activate()?;
//!
//!     println!("{}", proxy.invoke_twoway("greet", json!("world"))?);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod servant;
pub mod stop;
pub mod transport;

mod latch;
mod registry;

// Re-export commonly used types
pub use adapter::{AdapterHandle, AdapterState, ObjectAdapter};
pub use config::{AdapterConfig, MiddlewareConfig, RequestMode};
pub use error::{MiddlewareError, Result};
pub use protocol::{Request, Response, RuntimeException};
pub use proxy::ObjectProxy;
pub use servant::{Current, DispatchError, Servant, ServantBase};
pub use stop::{StopListener, StopSignal};
