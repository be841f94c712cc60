//! Worker side of the protocol.
//!
//! [`serve`] reads frames from the host, answers the built-in `ping`
//! handshake itself and hands every other request to a [`Handler`]. Handlers
//! run concurrently; each response is written as soon as it is ready, so
//! responses may leave in a different order than the requests arrived.
//!
//! The connection is symmetric: a handler can send its own requests to the
//! host through [`Host`] and wait for the answer before responding.

use std::future::Future;
use std::io;
use std::sync::{Arc, Weak};

use log::debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{ServiceError, ServiceResult};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, ProtocolError, Value};
use crate::service::{Channel, KeepAlive, ReferenceFlag, RequestFuture, RequestHandler};

const LOG_TARGET: &str = "tsunagi::worker";

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Outcome of one request. `Err` is reported to the host as an application
/// error for that request only.
pub type HandlerResult = Result<Value, String>;

/// Application logic behind the worker.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        command: &str,
        args: Value,
        host: Host,
    ) -> impl Future<Output = HandlerResult> + Send;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The host broke the protocol, e.g. answered a request never sent
    #[error("connection error: {0}")]
    Connection(#[from] ServiceError),
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Reported in answer to `ping`.
    pub version: String,
    pub max_frame_size: usize,
}

impl WorkerOptions {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Sends requests from a handler back to the host.
#[derive(Clone)]
pub struct Host {
    channel: Weak<Channel>,
}

impl Host {
    /// Send `command` to the host and wait for its answer.
    ///
    /// Fails with `ConnectionClosed` once the host has closed its end.
    pub async fn call(&self, command: &str, args: Value) -> ServiceResult<Value> {
        let channel = self
            .channel
            .upgrade()
            .ok_or(ServiceError::ConnectionClosed)?;
        channel.call(command, args).await
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("connected", &(self.channel.strong_count() > 0))
            .finish()
    }
}

/// Routes host requests to the built-in `ping` or the user's handler.
struct Dispatch<H> {
    handler: Arc<H>,
    version: String,
    host: Host,
}

impl<H: Handler> RequestHandler for Dispatch<H> {
    fn handle(&self, command: &str, args: Value) -> Option<RequestFuture> {
        if command == "ping" {
            let pong = Value::object([("version", self.version.as_str())]);
            return Some(Box::pin(std::future::ready(Ok(pong))));
        }
        let handler = Arc::clone(&self.handler);
        let host = self.host.clone();
        let command = command.to_string();
        Some(Box::pin(async move {
            handler.handle(&command, args, host).await
        }))
    }
}

/// Serve requests until the host closes its end.
///
/// Returns once the input is exhausted and every in-flight handler has
/// responded. Calls to the host still waiting at that point fail with
/// `ConnectionClosed`. A malformed frame or a response to a request never
/// sent ends serving with an error.
pub async fn serve<R, W, H>(
    mut reader: R,
    writer: W,
    handler: Arc<H>,
    options: WorkerOptions,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(write_frames(writer, rx));

    let keep_alive = Arc::new(KeepAlive::new(Arc::new(ReferenceFlag::new())));
    let channel = Arc::new_cyclic(|weak| {
        let dispatch = Dispatch {
            handler,
            version: options.version.clone(),
            host: Host {
                channel: weak.clone(),
            },
        };
        Channel::new(tx, keep_alive, options.max_frame_size)
            .with_request_handler(Arc::new(dispatch))
    });

    let result = read_frames(&mut reader, &channel, options.max_frame_size).await;
    channel.fail_all(ServiceError::ConnectionClosed);
    // The writer drains until the last in-flight handler drops its sender.
    drop(channel);
    result?;
    writer_task.await.map_err(io::Error::other)??;
    Ok(())
}

async fn read_frames<R>(
    reader: &mut R,
    channel: &Channel,
    max_frame_size: usize,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!(target: LOG_TARGET, "Host closed input");
            return Ok(());
        }
        for payload in decoder.push(&buf[..n]) {
            channel.on_frame(&payload?)?;
        }
    }
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
        writer.flush().await?;
    }
    Ok(())
}
