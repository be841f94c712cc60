//! Request multiplexing over one worker connection.
//!
//! The Channel allocates request ids, keeps the pending table and dispatches
//! inbound payloads to the caller waiting on that id. It does no I/O itself:
//! encoded frames go to an outbound queue drained by the writer task, and the
//! reader task feeds complete payloads to [`Channel::on_frame`].
//!
//! ```text
//! call()  ──register──▶ pending ──frame──▶ outbound queue ──▶ writer task
//!                          ▲                     ▲
//! reader task ─payload─▶ on_frame() ─resolve/reject by id─▶ caller
//!                          └─request─▶ RequestHandler ─response─┘
//! ```
//!
//! Requests flow both ways over the same connection. A request arriving from
//! the peer is answered through the [`RequestHandler`]; without one, or for a
//! command the handler does not know, the peer gets an `invalid command`
//! error and the connection stays up.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};

use super::keep_alive::{KeepAlive, KeepAliveRef};
use crate::error::{LockResultExt, ServiceError, ServiceResult};
use crate::protocol::{
    Packet, PacketBody, ProtocolResult, Value, decode_packet, encode_frame, encode_packet,
};

const LOG_TARGET: &str = "tsunagi::service::channel";

/// The eventual answer to a request from the peer.
pub type RequestFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'static>>;

/// Answers requests that arrive from the other end of a connection.
///
/// `None` means the command is unknown.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, command: &str, args: Value) -> Option<RequestFuture>;
}

impl<F> RequestHandler for F
where
    F: Fn(&str, Value) -> Option<RequestFuture> + Send + Sync + 'static,
{
    fn handle(&self, command: &str, args: Value) -> Option<RequestFuture> {
        self(command, args)
    }
}

/// A request waiting for its response.
struct PendingRequest {
    command: String,
    tx: oneshot::Sender<ServiceResult<Value>>,
    /// Keeps the worker referenced for as long as the entry lives.
    _keep_alive: KeepAliveRef,
}

struct ChannelState {
    pending: HashMap<u32, PendingRequest>,
    /// Set once by the first teardown; later calls fail with a clone of it.
    closed: Option<ServiceError>,
}

/// Multiplexes concurrent calls over a single outbound frame queue.
pub struct Channel {
    next_id: AtomicU32,
    state: Mutex<ChannelState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    keep_alive: Arc<KeepAlive>,
    max_frame_size: usize,
    requests: Option<Arc<dyn RequestHandler>>,
}

impl Channel {
    pub fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        keep_alive: Arc<KeepAlive>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            next_id: AtomicU32::new(0),
            state: Mutex::new(ChannelState {
                pending: HashMap::new(),
                closed: None,
            }),
            outbound,
            keep_alive,
            max_frame_size,
            requests: None,
        }
    }

    /// Answer requests from the peer with `handler`.
    pub fn with_request_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.requests = Some(handler);
        self
    }

    /// Send a request and wait for its response.
    ///
    /// Fails immediately with the stored termination error if the channel has
    /// been closed. Dropping the returned future does not withdraw the
    /// request: it stays pending until answered or until teardown.
    pub async fn call(&self, command: &str, args: Value) -> ServiceResult<Value> {
        let rx = self.send_request(command, args)?;
        match rx.await {
            Ok(result) => result,
            // Sender dropped without a value; only teardown does that.
            Err(_) => Err(self.termination_error()),
        }
    }

    /// Register a pending entry and queue the request frame.
    fn send_request(
        &self,
        command: &str,
        args: Value,
    ) -> ServiceResult<oneshot::Receiver<ServiceResult<Value>>> {
        let mut state = self.state.lock().recover_poison("Channel::send_request");
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }

        let id = self.allocate_id(&state.pending);
        let payload = encode_packet(&Packet::request(id, command, args))?;
        let frame = encode_frame(&payload, self.max_frame_size)?;

        // Registered before the frame is queued so the response always finds it.
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                command: command.to_string(),
                tx,
                _keep_alive: self.keep_alive.acquire(),
            },
        );

        if self.outbound.send(frame).is_err() {
            state.pending.remove(&id);
            return Err(state.closed.clone().unwrap_or(ServiceError::ConnectionClosed));
        }

        trace!(
            target: LOG_TARGET,
            "Sent request id={} command={} ({} bytes)",
            id,
            command,
            payload.len()
        );
        Ok(rx)
    }

    /// Next id not currently pending. The counter wraps at `u32::MAX`.
    fn allocate_id(&self, pending: &HashMap<u32, PendingRequest>) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Dispatch one complete inbound payload.
    ///
    /// An undecodable payload or a response to an id that is not pending is
    /// returned as a fatal error; the caller is expected to tear the
    /// connection down. Requests from the peer are answered asynchronously.
    pub fn on_frame(&self, payload: &[u8]) -> ServiceResult<()> {
        let Packet { id, body } = decode_packet(payload)?;
        let outcome = match body {
            PacketBody::Request { command, args } => {
                self.answer(id, command, args);
                return Ok(());
            }
            PacketBody::Response(outcome) => outcome,
        };

        let entry = self
            .state
            .lock()
            .recover_poison("Channel::on_frame")
            .pending
            .remove(&id)
            .ok_or(ServiceError::UnknownRequestId(id))?;

        trace!(
            target: LOG_TARGET,
            "Received response id={} command={} ok={}",
            id,
            entry.command,
            outcome.is_ok()
        );

        let result = outcome.map_err(|message| ServiceError::Remote {
            command: entry.command.clone(),
            message,
        });
        // The caller may have given up waiting; that is not an error here.
        let _ = entry.tx.send(result);
        Ok(())
    }

    /// Reply to a request from the peer.
    ///
    /// The handler runs on its own task and holds a keep-alive reference
    /// while it runs.
    fn answer(&self, id: u32, command: String, args: Value) {
        trace!(target: LOG_TARGET, "Received request id={} command={}", id, command);
        let handled = self
            .requests
            .as_ref()
            .and_then(|handler| handler.handle(&command, args));
        let Some(future) = handled else {
            debug!(target: LOG_TARGET, "No handler for request {}", command);
            let outcome = Err(format!("invalid command: {command}"));
            queue_response(&self.outbound, id, outcome, self.max_frame_size);
            return;
        };

        let outbound = self.outbound.clone();
        let max_frame_size = self.max_frame_size;
        let busy = self.keep_alive.acquire();
        tokio::spawn(async move {
            let outcome = future.await;
            drop(busy);
            queue_response(&outbound, id, outcome, max_frame_size);
        });
    }

    /// Reject every pending request with `error` and refuse new calls.
    ///
    /// Returns `false` if the channel was already closed, in which case
    /// nothing is rejected twice.
    pub fn fail_all(&self, error: ServiceError) -> bool {
        let drained = {
            let mut state = self.state.lock().recover_poison("Channel::fail_all");
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(error.clone());
            std::mem::take(&mut state.pending)
        };

        if !drained.is_empty() {
            debug!(
                target: LOG_TARGET,
                "Rejecting {} pending request(s): {}",
                drained.len(),
                error
            );
        }
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        true
    }

    /// Close with `error` only if nothing is pending.
    ///
    /// The check and the close happen under one lock, so a request is either
    /// registered first (and the close is refused) or fails fast afterwards.
    pub fn close_if_idle(&self, error: ServiceError) -> bool {
        let mut state = self.state.lock().recover_poison("Channel::close_if_idle");
        if state.closed.is_some() || !state.pending.is_empty() {
            return false;
        }
        state.closed = Some(error);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .recover_poison("Channel::is_closed")
            .closed
            .is_some()
    }

    /// The error the channel was closed with, or `ConnectionClosed`.
    pub fn termination_error(&self) -> ServiceError {
        self.state
            .lock()
            .recover_poison("Channel::termination_error")
            .closed
            .clone()
            .unwrap_or(ServiceError::ConnectionClosed)
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .recover_poison("Channel::pending_count")
            .pending
            .len()
    }

    pub fn keep_alive(&self) -> &Arc<KeepAlive> {
        &self.keep_alive
    }
}

/// Queue a response frame. A result that cannot be framed becomes an error
/// response for the same id.
fn queue_response(
    outbound: &mpsc::UnboundedSender<Vec<u8>>,
    id: u32,
    outcome: Result<Value, String>,
    max_frame_size: usize,
) {
    let frame = response_frame(id, outcome, max_frame_size).or_else(|e| {
        warn!(target: LOG_TARGET, "Cannot encode response {}: {}", id, e);
        response_frame(id, Err(format!("cannot encode response: {e}")), max_frame_size)
    });
    match frame {
        // Fails only once the writer has stopped, which is teardown anyway.
        Ok(frame) => {
            let _ = outbound.send(frame);
        }
        Err(e) => warn!(target: LOG_TARGET, "Dropping response {}: {}", id, e),
    }
}

fn response_frame(
    id: u32,
    outcome: Result<Value, String>,
    max_frame_size: usize,
) -> ProtocolResult<Vec<u8>> {
    encode_frame(&encode_packet(&Packet::response(id, outcome))?, max_frame_size)
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .field("answers_requests", &self.requests.is_some())
            .finish()
    }
}
