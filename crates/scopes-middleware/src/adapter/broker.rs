//! The broker thread: moves requests from the public endpoint to the workers
//! and replies back to the connection each request came from.
//!
//! Distribution is pull based. A worker announces itself as ready, the broker
//! keeps ready workers in a queue and only reads an inbound request while the
//! queue is non-empty. Every forwarded request is therefore in a worker's
//! hands, and the least recently used worker always gets the next one.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::AdapterInner;
use crate::config::{MiddlewareConfig, RequestMode};
use crate::error::{MiddlewareError, Result};
use crate::stop::StopListener;
use crate::transport::{self, BoundEndpoint};

pub(super) type ConnectionId = u64;

/// A request handed to a worker.
#[derive(Debug)]
pub(super) struct Job {
    pub(super) connection: ConnectionId,
    pub(super) frame: Vec<u8>,
}

/// Messages from workers to the broker.
#[derive(Debug)]
pub(super) enum WorkerEvent {
    /// The worker can take another request.
    Ready { worker: usize },
    /// The worker finished a twoway request and can take another.
    Reply {
        worker: usize,
        connection: ConnectionId,
        frame: Vec<u8>,
    },
}

struct Inbound {
    connection: ConnectionId,
    frame: Vec<u8>,
}

struct Connection {
    replies: UnboundedSender<Vec<u8>>,
    reader: task::JoinHandle<()>,
    writer: task::JoinHandle<()>,
}

pub(super) fn spawn(
    inner: Arc<AdapterInner>,
    events: UnboundedReceiver<WorkerEvent>,
    workers: Vec<UnboundedSender<Job>>,
    ready: SyncSender<Result<()>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-broker", inner.name()))
        .spawn(move || run(inner, events, workers, ready))
}

fn run(
    inner: Arc<AdapterInner>,
    events: UnboundedReceiver<WorkerEvent>,
    workers: Vec<UnboundedSender<Job>>,
    ready: SyncSender<Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };

    let endpoint = {
        let _guard = runtime.enter();
        match transport::safe_bind(inner.endpoint()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        }
    };
    info!("Object adapter {} bound to {}", inner.name(), inner.endpoint());
    // The activating thread is blocked on this send; it cannot be gone.
    let _ = ready.send(Ok(()));

    let mut broker = Broker {
        stop: inner.stop.subscribe(),
        twoway: inner.mode() == RequestMode::Twoway,
        inner: Arc::clone(&inner),
        events,
        workers,
        ready_workers: VecDeque::new(),
        connections: HashMap::new(),
        next_connection: 0,
        pending: 0,
    };

    let result = runtime.block_on(async {
        let result = broker.pump(&endpoint).await;
        broker.linger().await;
        result
    });
    drop(endpoint);

    match result {
        Ok(()) => debug!("Broker for {} exited", inner.name()),
        Err(e) => {
            inner.record_failure(MiddlewareError::BrokerFailure {
                adapter: inner.name().to_string(),
                source: Box::new(e),
            });
        }
    }
}

struct Broker {
    inner: Arc<AdapterInner>,
    stop: StopListener,
    events: UnboundedReceiver<WorkerEvent>,
    workers: Vec<UnboundedSender<Job>>,
    ready_workers: VecDeque<usize>,
    connections: HashMap<ConnectionId, Connection>,
    next_connection: ConnectionId,
    /// Twoway requests forwarded and not yet answered.
    pending: usize,
    twoway: bool,
}

impl Broker {
    async fn pump(&mut self, endpoint: &BoundEndpoint) -> Result<()> {
        let listener = endpoint.listener();
        // Readers wait for room here, so a connection that floods the
        // adapter stops being read while every worker is busy.
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(self.workers.len().max(1));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<ConnectionId>();
        let idle_timeout = self.inner.config.idle_timeout;
        let mut last_activity = Instant::now();
        let mut draining = false;

        loop {
            if draining && self.pending == 0 {
                return Ok(());
            }

            let idle_deadline = last_activity + idle_timeout.unwrap_or(Duration::from_secs(86_400));

            tokio::select! {
                biased;

                _ = self.stop.stopped(), if !draining => {
                    debug!("Broker for {} stopping with {} pending", self.inner.name(), self.pending);
                    draining = true;
                    // Closing the job queues ends each worker once it has
                    // run everything already forwarded to it.
                    self.workers.clear();
                }

                event = self.events.recv() => match event {
                    Some(event) => self.on_worker_event(event),
                    None if draining => return Ok(()),
                    None => return Err(MiddlewareError::io("all workers exited")),
                },

                closed = closed_rx.recv() => {
                    if let Some(connection) = closed {
                        debug!("Connection {} closed", connection);
                        self.connections.remove(&connection);
                    }
                }

                accepted = listener.accept(), if !draining => {
                    let (stream, _) = accepted?;
                    self.open_connection(stream, inbound_tx.clone(), closed_tx.clone());
                    last_activity = Instant::now();
                }

                inbound = inbound_rx.recv(), if !draining && !self.ready_workers.is_empty() => {
                    if let Some(inbound) = inbound {
                        self.forward(inbound)?;
                        last_activity = Instant::now();
                    }
                }

                _ = time::sleep_until(idle_deadline), if idle_timeout.is_some() && !draining => {
                    last_activity = Instant::now();
                    if self.inner.registry.has_defaults() {
                        continue;
                    }
                    info!("Object adapter {} idle, shutting down", self.inner.name());
                    if let Err(e) = self.inner.shutdown() {
                        warn!("Idle shutdown of {} failed: {}", self.inner.name(), e);
                    }
                }
            }
        }
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker } => self.ready_workers.push_back(worker),
            WorkerEvent::Reply {
                worker,
                connection,
                frame,
            } => {
                self.ready_workers.push_back(worker);
                if self.pending > 0 {
                    self.pending -= 1;
                    self.send_reply(connection, frame);
                }
            }
        }
    }

    fn forward(&mut self, inbound: Inbound) -> Result<()> {
        let Some(worker) = self.ready_workers.pop_front() else {
            return Err(MiddlewareError::io("no ready worker for inbound request"));
        };
        let job = Job {
            connection: inbound.connection,
            frame: inbound.frame,
        };
        self.workers[worker]
            .send(job)
            .map_err(|_| MiddlewareError::io(format!("worker {} is gone", worker)))?;
        if self.twoway {
            self.pending += 1;
        }
        Ok(())
    }

    fn send_reply(&mut self, connection: ConnectionId, frame: Vec<u8>) {
        match self.connections.get(&connection) {
            Some(conn) if conn.replies.send(frame).is_ok() => {}
            _ => debug!("Dropping reply for closed connection {}", connection),
        }
    }

    fn open_connection(
        &mut self,
        stream: UnixStream,
        inbound: Sender<Inbound>,
        closed: UnboundedSender<ConnectionId>,
    ) {
        let id = self.next_connection;
        self.next_connection += 1;
        debug!("Connection {} accepted on {}", id, self.inner.endpoint());

        let (mut read_half, mut write_half) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader = tokio::spawn(async move {
            loop {
                match transport::read_frame(&mut read_half).await {
                    Ok(Some(frame)) => {
                        if inbound.send(Inbound { connection: id, frame }).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Connection {} read error: {}", id, e);
                        break;
                    }
                }
            }
            let _ = closed.send(id);
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = reply_rx.recv().await {
                if let Err(e) = transport::write_frame(&mut write_half, &frame).await {
                    debug!("Connection {} write error: {}", id, e);
                    break;
                }
            }
        });

        self.connections.insert(
            id,
            Connection {
                replies: reply_tx,
                reader,
                writer,
            },
        );
    }

    /// Give queued replies a bounded amount of time to reach their clients.
    async fn linger(&mut self) {
        let deadline = Instant::now() + MiddlewareConfig::LINGER;
        for (_, connection) in self.connections.drain() {
            connection.reader.abort();
            drop(connection.replies);
            if time::timeout_at(deadline, connection.writer).await.is_err() {
                debug!("Linger expired with replies still queued");
            }
        }
    }
}
