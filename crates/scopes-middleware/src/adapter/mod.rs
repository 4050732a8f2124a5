//! Object adapter: owns an endpoint, a servant registry, a broker thread and
//! a pool of worker threads.
//!
//! # Locking
//!
//! Two locks exist: the registry lock and the state lock. Operations that need
//! both take the registry lock first. Servants are only ever dropped with no
//! adapter lock held, so a servant's `Drop` may call `remove`/`find` on the
//! adapter that owned it.
//!
//! # Example
//!
//! ```rust,no_run
//! use scopes_middleware::{AdapterConfig, ObjectAdapter, RequestMode, ServantBase};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> scopes_middleware::Result<()> {
//! let config = AdapterConfig::new("testscope", "ipc:///tmp/testscope", RequestMode::Twoway)
//!     .pool_size(4);
//! let adapter = ObjectAdapter::new(config)?;
//!
//! let servant = ServantBase::new().operation("success_op", |_, _| Ok(json!(null)));
//! let proxy = adapter.add("some_id", Arc::new(servant))?;
//! adapter.activate()?;
//!
//! proxy.invoke_twoway("success_op", json!({}))?;
//!
//! adapter.shutdown()?;
//! adapter.wait_for_shutdown()?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod state;
mod worker;

pub use state::AdapterState;
pub(crate) use state::StateCell;

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Once, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{AdapterConfig, RequestMode};
use crate::error::{MiddlewareError, Result};
use crate::latch::ReadyLatch;
use crate::proxy::ObjectProxy;
use crate::registry::ServantRegistry;
use crate::servant::Servant;
use crate::stop::StopSignal;

/// State shared between the adapter handle and its threads.
pub(crate) struct AdapterInner {
    config: AdapterConfig,
    state: StateCell,
    registry: ServantRegistry,
    stop: StopSignal,
    threads: Mutex<Vec<JoinHandle<()>>>,
    cleanup: Once,
}

impl AdapterInner {
    fn new(config: AdapterConfig) -> Self {
        Self {
            state: StateCell::new(&config.name),
            registry: ServantRegistry::new(&config.name),
            stop: StopSignal::new(),
            threads: Mutex::new(Vec::new()),
            cleanup: Once::new(),
            config,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub(crate) fn mode(&self) -> RequestMode {
        self.config.mode
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `Failed`, remember the fault and stop every thread.
    pub(crate) fn record_failure(&self, error: MiddlewareError) -> Arc<MiddlewareError> {
        error!("Object adapter {} failed: {}", self.name(), error);
        let shared = self.state.fail(error);
        self.stop.stop();
        shared
    }

    fn add(&self, id: &str, servant: Arc<dyn Servant>) -> Result<ObjectProxy> {
        self.registry.add(&self.state, id, servant)?;
        Ok(ObjectProxy::new(self.endpoint(), id, "", self.mode()))
    }

    fn remove(&self, id: &str) -> Result<Arc<dyn Servant>> {
        self.registry.remove(&self.state, id)
    }

    fn find(&self, id: &str) -> Result<Option<Arc<dyn Servant>>> {
        self.registry.find(&self.state, id)
    }

    fn activate(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let current = guard.state;
            match current {
                AdapterState::Activating | AdapterState::Active => return Ok(()),
                AdapterState::Inactive => self.state.set(&mut guard, AdapterState::Activating),
                _ => return Err(self.state.bad_state("activate()", &guard)),
            }
        }

        info!(
            "Activating object adapter {} on {} ({}, {} workers)",
            self.name(),
            self.endpoint(),
            self.mode(),
            self.config.pool_size
        );

        match self.run_workers() {
            Ok(()) => {
                let mut guard = self.state.lock();
                if guard.state == AdapterState::Activating {
                    self.state.set(&mut guard, AdapterState::Active);
                    Ok(())
                } else {
                    // A thread failed after reporting ready.
                    Err(self.state.bad_state("activate()", &guard))
                }
            }
            Err(e) => Err(MiddlewareError::Shared(self.record_failure(e))),
        }
    }

    /// Start the broker, wait until it has bound, then start the workers
    /// and wait until every one of them can receive work.
    fn run_workers(self: &Arc<Self>) -> Result<()> {
        let pool_size = self.config.pool_size;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (job_txs, job_rxs): (Vec<_>, Vec<_>) = (0..pool_size).map(|_| mpsc::unbounded_channel()).unzip();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let broker = broker::spawn(Arc::clone(self), event_rx, job_txs, ready_tx)?;
        self.lock_threads().push(broker);

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(MiddlewareError::BrokerFailure {
                    adapter: self.name().to_string(),
                    source: Box::new(e),
                })
            }
            Err(_) => {
                return Err(MiddlewareError::BrokerFailure {
                    adapter: self.name().to_string(),
                    source: Box::new(MiddlewareError::io("broker exited before becoming ready")),
                })
            }
        }

        let latch = ReadyLatch::new(pool_size);
        for (index, jobs) in job_rxs.into_iter().enumerate() {
            let handle = worker::spawn(
                Arc::clone(self),
                index,
                jobs,
                event_tx.clone(),
                latch.clone(),
            )?;
            self.lock_threads().push(handle);
        }
        drop(event_tx);

        latch.wait().map_err(|message| MiddlewareError::WorkerFailure {
            adapter: self.name().to_string(),
            message,
        })
    }

    fn shutdown(&self) -> Result<()> {
        let mut guard = self.state.lock();
        guard = self
            .state
            .wait_while(guard, |s| s.state == AdapterState::Activating);

        let current = guard.state;
        match current {
            AdapterState::Deactivating | AdapterState::Destroyed => Ok(()),
            AdapterState::Failed => Err(self.state.bad_state("shutdown()", &guard)),
            AdapterState::Inactive => {
                self.state.set(&mut guard, AdapterState::Destroyed);
                Ok(())
            }
            AdapterState::Active | AdapterState::Activating => {
                self.state.set(&mut guard, AdapterState::Deactivating);
                drop(guard);
                info!("Shutting down object adapter {}", self.name());
                self.stop.stop();
                Ok(())
            }
        }
    }

    fn wait_for_shutdown(&self) -> Result<()> {
        {
            let guard = self.state.lock();
            let mut guard = self.state.wait_while(guard, |s| {
                !matches!(
                    s.state,
                    AdapterState::Deactivating | AdapterState::Destroyed | AdapterState::Failed
                )
            });
            if guard.state == AdapterState::Deactivating {
                self.state.set(&mut guard, AdapterState::Destroyed);
            }
        }

        self.cleanup.call_once(|| self.cleanup());

        let guard = self.state.lock();
        if guard.state == AdapterState::Failed {
            return Err(self.state.bad_state("wait_for_shutdown()", &guard));
        }
        Ok(())
    }

    /// Join every thread, then empty the registry. Runs with no lock held.
    fn cleanup(&self) {
        self.stop.stop();

        let threads = std::mem::take(&mut *self.lock_threads());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if handle.join().is_err() {
                error!("Thread {} panicked", name);
            }
        }

        let servants = self.registry.take_all();
        debug!(
            "Object adapter {} releasing {} servant(s)",
            self.name(),
            servants.len()
        );
        drop(servants);
    }
}

/// An object adapter.
///
/// Dropping the adapter shuts it down and waits for its threads.
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl ObjectAdapter {
    /// Create an inactive adapter.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(AdapterInner::new(config)),
        })
    }

    /// Adapter name, as used in error messages and thread names.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The `ipc://` endpoint this adapter binds.
    pub fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    /// Whether the adapter serves twoway or oneway requests.
    pub fn mode(&self) -> RequestMode {
        self.inner.mode()
    }

    /// Configuration the adapter was created with.
    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AdapterState {
        self.inner.state.current()
    }

    /// A weak handle that servants can keep without keeping the adapter alive.
    pub fn handle(&self) -> AdapterHandle {
        AdapterHandle {
            inner: Arc::downgrade(&self.inner),
            name: self.name().to_string(),
        }
    }

    /// Register `servant` under `id` and return a proxy for it.
    pub fn add(&self, id: &str, servant: Arc<dyn Servant>) -> Result<ObjectProxy> {
        self.inner.add(id, servant)
    }

    /// Unregister `id`, returning the servant to the caller.
    pub fn remove(&self, id: &str) -> Result<Arc<dyn Servant>> {
        self.inner.remove(id)
    }

    /// Returns `Ok(None)` if nothing is registered under `id`.
    pub fn find(&self, id: &str) -> Result<Option<Arc<dyn Servant>>> {
        self.inner.find(id)
    }

    /// Register the fallback servant for `category`.
    pub fn add_default(&self, category: &str, servant: Arc<dyn Servant>) -> Result<()> {
        self.inner.registry.add_default(&self.inner.state, category, servant)
    }

    /// Unregister the fallback servant for `category`, returning it.
    pub fn remove_default(&self, category: &str) -> Result<Arc<dyn Servant>> {
        self.inner.registry.remove_default(&self.inner.state, category)
    }

    /// Returns `Ok(None)` if `category` has no fallback servant.
    pub fn find_default(&self, category: &str) -> Result<Option<Arc<dyn Servant>>> {
        self.inner.registry.find_default(&self.inner.state, category)
    }

    /// Look up `id`, falling back to the default servant for `category`.
    pub fn find_servant(&self, id: &str, category: &str) -> Result<Option<Arc<dyn Servant>>> {
        self.inner.registry.find_servant(&self.inner.state, id, category)
    }

    /// Bind the endpoint and start the broker and workers.
    ///
    /// Blocks until every thread is ready. A no-op while already active or
    /// activating. On failure the adapter is left `Failed`.
    pub fn activate(&self) -> Result<()> {
        self.inner.activate()
    }

    /// Ask the adapter to stop. Does not wait for the threads to finish.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    /// Block until the adapter has been shut down (or has failed), then
    /// join its threads and release its servants. Cleanup runs only once,
    /// however many threads call this.
    pub fn wait_for_shutdown(&self) -> Result<()> {
        self.inner.wait_for_shutdown()
    }
}

impl Drop for ObjectAdapter {
    fn drop(&mut self) {
        if let Err(e) = self.inner.shutdown() {
            warn!("Object adapter {}: {}", self.name(), e);
        }
        if let Err(e) = self.inner.wait_for_shutdown() {
            warn!("Object adapter {}: {}", self.name(), e);
        }
    }
}

/// Weak reference to an [`ObjectAdapter`].
///
/// Once the adapter has been dropped every operation fails with a
/// `Destroyed` bad-state error.
#[derive(Clone)]
pub struct AdapterHandle {
    inner: Weak<AdapterInner>,
    name: String,
}

impl AdapterHandle {
    fn upgrade(&self, label: &str) -> Result<Arc<AdapterInner>> {
        self.inner.upgrade().ok_or_else(|| MiddlewareError::BadState {
            label: label.to_string(),
            state: AdapterState::Destroyed,
            adapter: self.name.clone(),
            cause: None,
        })
    }

    /// Name of the adapter this handle refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// See [`ObjectAdapter::add`].
    pub fn add(&self, id: &str, servant: Arc<dyn Servant>) -> Result<ObjectProxy> {
        self.upgrade("add()")?.add(id, servant)
    }

    /// See [`ObjectAdapter::remove`].
    pub fn remove(&self, id: &str) -> Result<Arc<dyn Servant>> {
        self.upgrade("remove()")?.remove(id)
    }

    /// See [`ObjectAdapter::find`].
    pub fn find(&self, id: &str) -> Result<Option<Arc<dyn Servant>>> {
        self.upgrade("find()")?.find(id)
    }

    /// See [`ObjectAdapter::shutdown`].
    pub fn shutdown(&self) -> Result<()> {
        self.upgrade("shutdown()")?.shutdown()
    }

    /// State of the adapter, or `Destroyed` once it has been dropped.
    pub fn state(&self) -> AdapterState {
        self.inner
            .upgrade()
            .map(|inner| inner.state.current())
            .unwrap_or(AdapterState::Destroyed)
    }
}
