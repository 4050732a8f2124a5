//! Worker threads: decode a request, find its servant, dispatch, reply.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

use super::broker::{Job, WorkerEvent};
use super::AdapterInner;
use crate::config::RequestMode;
use crate::error::MiddlewareError;
use crate::latch::ReadyLatch;
use crate::protocol::{self, Response, WireMode};
use crate::servant::{self, Current};

/// Result of handling one request.
#[derive(Debug, PartialEq)]
pub(super) enum Outcome {
    /// A response for the caller, whether success or a runtime exception.
    Reply(Response),
    /// The request itself was unusable.
    ProtocolFault(String),
}

pub(super) fn spawn(
    inner: Arc<AdapterInner>,
    index: usize,
    jobs: UnboundedReceiver<Job>,
    events: UnboundedSender<WorkerEvent>,
    latch: ReadyLatch,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("{}-worker-{}", inner.name(), index);
    let failed = latch.clone();
    thread::Builder::new()
        .name(name)
        .spawn(move || run(inner, index, jobs, events, latch))
        .inspect_err(|e| failed.fail(format!("cannot start worker {}: {}", index, e)))
}

fn run(
    inner: Arc<AdapterInner>,
    index: usize,
    mut jobs: UnboundedReceiver<Job>,
    events: UnboundedSender<WorkerEvent>,
    latch: ReadyLatch,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let message = format!("worker {}: cannot build runtime: {}", index, e);
            latch.fail(message.clone());
            inner.record_failure(MiddlewareError::WorkerFailure {
                adapter: inner.name().to_string(),
                message,
            });
            return;
        }
    };

    if events.send(WorkerEvent::Ready { worker: index }).is_err() {
        latch.fail(format!("broker exited before worker {} was ready", index));
        return;
    }
    latch.count_down();

    // The broker closes the queue once it stops forwarding. Jobs already
    // queued are still delivered before `recv` returns `None`.
    while let Some(job) = runtime.block_on(jobs.recv()) {
        let event = match handle_job(&inner, &job.frame) {
            Some(frame) => WorkerEvent::Reply {
                worker: index,
                connection: job.connection,
                frame,
            },
            None => WorkerEvent::Ready { worker: index },
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("Worker {} of {} exiting", index, inner.name());
}

/// Handle one request frame, returning the reply frame for twoway adapters.
fn handle_job(inner: &AdapterInner, frame: &[u8]) -> Option<Vec<u8>> {
    let outcome = handle_request(inner, frame);
    match inner.mode() {
        RequestMode::Twoway => {
            let response = match outcome {
                Outcome::Reply(response) => response,
                Outcome::ProtocolFault(reason) => Response::unknown(reason),
            };
            match protocol::encode_response(&response) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    error!("Cannot encode response on {}: {}", inner.name(), e);
                    protocol::encode_response(&Response::unknown(e.to_string())).ok()
                }
            }
        }
        RequestMode::Oneway => {
            if let Outcome::ProtocolFault(reason) = outcome {
                warn!("{}", reason);
            }
            None
        }
    }
}

pub(super) fn handle_request(inner: &AdapterInner, frame: &[u8]) -> Outcome {
    let request = match protocol::decode_request(frame) {
        Ok(request) => request,
        Err(e) => {
            return Outcome::ProtocolFault(format!(
                "ObjectAdapter: error unmarshaling request header (adapter: {}): {}",
                inner.name(),
                e
            ))
        }
    };

    if !request.is_well_formed() {
        return Outcome::ProtocolFault("Invalid message header".to_string());
    }

    match (request.mode, inner.mode()) {
        (WireMode::Oneway, RequestMode::Twoway) => {
            return Outcome::ProtocolFault(format!(
                "ObjectAdapter: oneway invocation sent to twoway adapter (id: {}, adapter: {}, op: {})",
                request.id,
                inner.name(),
                request.op_name
            ))
        }
        (WireMode::Twoway, RequestMode::Oneway) => {
            return Outcome::ProtocolFault(format!(
                "ObjectAdapter: twoway invocation sent to oneway adapter (id: {}, adapter: {}, op: {})",
                request.id,
                inner.name(),
                request.op_name
            ))
        }
        _ => {}
    }

    // A destroyed registry is treated like a missing servant.
    let servant = inner
        .registry
        .find_servant(&inner.state, &request.id, &request.cat)
        .ok()
        .flatten();
    let Some(servant) = servant else {
        debug!("No servant for {} on {}", request.id, inner.name());
        return Outcome::Reply(Response::object_not_exist(
            inner.endpoint(),
            &request.id,
            &request.cat,
            inner.name(),
        ));
    };

    let current = Current {
        adapter: inner.name().to_string(),
        endpoint: inner.endpoint().to_string(),
        id: request.id,
        category: request.cat,
        op_name: request.op_name,
    };
    Outcome::Reply(servant::safe_dispatch(&servant, &current, &request.in_params))
}
