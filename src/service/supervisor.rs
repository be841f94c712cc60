//! Worker process supervision.
//!
//! [`WorkerProcess`] owns one worker: its child process, a writer task
//! draining the Channel's outbound queue into stdin, a reader task feeding
//! stdout through the frame decoder into the Channel, and an exit watcher.
//!
//! Every failure source ends up in the same teardown path:
//!
//! | source               | error                |
//! |----------------------|----------------------|
//! | stdin write fails    | `Write`              |
//! | stdout read fails    | `Read`               |
//! | stdout EOF           | `ConnectionClosed`   |
//! | process exits        | `Exited`             |
//! | malformed frame      | `Protocol` and kin   |
//! | `close()` / drop     | caller's / `Stopped` |
//!
//! Only the first one counts. It closes the Channel (rejecting everything
//! pending with that error) and cancels the tasks, which drops stdin/stdout
//! and kills the child.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::{Channel, RequestHandler};
use super::keep_alive::{KeepAlive, ReferenceFlag};
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::protocol::{
    FrameDecoder, Packet, PacketBody, ProtocolResult, Value, decode_packet, encode_frame,
    encode_packet,
};

const LOG_TARGET: &str = "tsunagi::service::supervisor";

/// Bytes requested from stdout per read.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// State shared between the handle and its I/O tasks.
struct Shared {
    channel: Channel,
    cancel: CancellationToken,
}

impl Shared {
    /// The single teardown path. Idempotent: later calls are no-ops.
    fn close(&self, error: ServiceError) {
        // fail_all flips the closed flag atomically, so exactly one caller wins.
        if !self.channel.fail_all(error.clone()) {
            return;
        }
        match error {
            ServiceError::Stopped => debug!(target: LOG_TARGET, "Stopping worker"),
            _ => warn!(target: LOG_TARGET, "Worker connection closed: {}", error),
        }
        self.cancel.cancel();
    }

    /// Tear down with `Stopped` unless a request is outstanding.
    fn close_if_idle(&self) -> bool {
        if !self.channel.close_if_idle(ServiceError::Stopped) {
            return false;
        }
        debug!(target: LOG_TARGET, "Stopping idle worker");
        self.cancel.cancel();
        true
    }
}

/// Handle to a running worker process.
///
/// Dropping the handle tears the worker down with [`ServiceError::Stopped`].
pub struct WorkerProcess {
    shared: Arc<Shared>,
    flag: Arc<ReferenceFlag>,
    pid: Option<u32>,
    _tasks: Vec<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Spawn the configured worker and complete the ping handshake.
    ///
    /// The worker is started as `program args... --service=<version> --ping`
    /// with piped stdin/stdout and inherited stderr. Requests the worker sends
    /// back are answered by `requests`.
    pub async fn spawn(
        config: &ServiceConfig,
        requests: Option<Arc<dyn RequestHandler>>,
    ) -> ServiceResult<Self> {
        let program = config.worker.program.display().to_string();
        let mut command = worker_command(config);
        command.arg("--ping");

        let mut child = command
            .spawn()
            .map_err(|e| ServiceError::spawn(&program, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServiceError::spawn(&program, io::Error::other("stdin not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServiceError::spawn(&program, io::Error::other("stdout not piped")))?;

        debug!(
            target: LOG_TARGET,
            "Spawned worker {} (pid {:?})",
            program,
            child.id()
        );

        let process = Self::from_streams(
            stdout,
            stdin,
            Some(child),
            config.max_frame_size,
            requests,
        );
        process
            .handshake(&config.version, config.handshake_timeout())
            .await?;
        Ok(process)
    }

    /// Run a single request in a worker that exits afterwards.
    ///
    /// The worker is started as `program args... --service=<version>`, gets
    /// the request followed by end of input, and its whole stdout is read
    /// once it has exited. There is no handshake and the worker cannot send
    /// requests back.
    pub async fn run_once(
        config: &ServiceConfig,
        command: &str,
        args: Value,
    ) -> ServiceResult<Value> {
        let program = config.worker.program.display().to_string();
        let frame = encode_frame(
            &encode_packet(&Packet::request(0, command, args))?,
            config.max_frame_size,
        )?;

        let mut child = worker_command(config)
            .spawn()
            .map_err(|e| ServiceError::spawn(&program, e))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServiceError::spawn(&program, io::Error::other("stdin not piped")))?;
        debug!(
            target: LOG_TARGET,
            "Spawned one-shot worker {} (pid {:?})",
            program,
            child.id()
        );

        // Written concurrently so a worker that answers early cannot stall us.
        let write = async move {
            stdin.write_all(&frame).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|e| ServiceError::Read(Arc::new(e)))?;

        let mut decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
        let frames = decoder
            .push(&output.stdout)
            .collect::<ProtocolResult<Vec<_>>>()?;
        let Some((first, rest)) = frames.split_first() else {
            if let Err(e) = written {
                return Err(ServiceError::Write(Arc::new(e)));
            }
            return Err(if output.status.success() {
                ServiceError::ConnectionClosed
            } else {
                ServiceError::Exited(output.status.to_string())
            });
        };
        if let Some(extra) = rest.first() {
            return Err(unsolicited(decode_packet(extra)?));
        }

        match decode_packet(first)? {
            Packet {
                id: 0,
                body: PacketBody::Response(outcome),
            } => outcome.map_err(|message| ServiceError::Remote {
                command: command.to_string(),
                message,
            }),
            other => Err(unsolicited(other)),
        }
    }

    /// Wire a worker connection over arbitrary byte streams.
    ///
    /// `reader` carries worker→host frames, `writer` host→worker frames. When
    /// a child is given it is killed on teardown and its exit tears the
    /// connection down. No handshake is performed.
    pub fn from_streams<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        max_frame_size: usize,
        requests: Option<Arc<dyn RequestHandler>>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let flag = Arc::new(ReferenceFlag::new());
        let keep_alive = Arc::new(KeepAlive::new(flag.clone()));
        let mut channel = Channel::new(outbound_tx, keep_alive, max_frame_size);
        if let Some(requests) = requests {
            channel = channel.with_request_handler(requests);
        }
        let shared = Arc::new(Shared {
            channel,
            cancel: CancellationToken::new(),
        });

        let pid = child.as_ref().and_then(Child::id);
        let mut tasks = vec![
            tokio::spawn(writer_loop(writer, outbound_rx, Arc::clone(&shared))),
            tokio::spawn(reader_loop(reader, Arc::clone(&shared), max_frame_size)),
        ];
        if let Some(child) = child {
            tasks.push(tokio::spawn(exit_watcher(child, Arc::clone(&shared))));
        }

        Self {
            shared,
            flag,
            pid,
            _tasks: tasks,
        }
    }

    /// Exchange versions with the worker.
    ///
    /// Any failure, including a version mismatch, tears the connection down
    /// and is returned.
    pub async fn handshake(&self, version: &str, timeout: Duration) -> ServiceResult<()> {
        let result = self.ping(version, timeout).await;
        match &result {
            Ok(()) => debug!(target: LOG_TARGET, "Handshake complete (version {})", version),
            Err(e) => self.close(Some(e.clone())),
        }
        result
    }

    async fn ping(&self, version: &str, timeout: Duration) -> ServiceResult<()> {
        let args = Value::object([("version", version)]);
        let response = match tokio::time::timeout(timeout, self.call("ping", args)).await {
            Ok(Ok(response)) => response,
            Ok(Err(ServiceError::Remote { message, .. })) => {
                return Err(ServiceError::Handshake(message));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ServiceError::Handshake(format!(
                    "no ping response within {:?}",
                    timeout
                )));
            }
        };

        match response.get("version").and_then(Value::as_str) {
            Some(worker) if worker == version => Ok(()),
            Some(worker) => Err(ServiceError::VersionMismatch {
                host: version.to_string(),
                worker: worker.to_string(),
            }),
            None => Err(ServiceError::Handshake(
                "ping response carries no version".to_string(),
            )),
        }
    }

    /// Send one request and wait for its response.
    pub async fn call(&self, command: &str, args: Value) -> ServiceResult<Value> {
        self.shared.channel.call(command, args).await
    }

    /// Tear the worker down. `None` closes with `ConnectionClosed`.
    pub fn close(&self, error: Option<ServiceError>) {
        self.shared
            .close(error.unwrap_or(ServiceError::ConnectionClosed));
    }

    /// Stop the worker only if no request is outstanding.
    pub(crate) fn close_if_idle(&self) -> bool {
        self.shared.close_if_idle()
    }

    /// Resolves once teardown has started.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await;
    }

    /// Token cancelled on teardown, for watchers that must not keep the
    /// handle alive.
    pub(crate) fn close_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.channel.is_closed()
    }

    /// Whether any request is outstanding.
    pub fn is_referenced(&self) -> bool {
        self.flag.is_referenced()
    }

    pub(crate) fn subscribe_referenced(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.channel.pending_count()
    }

    /// OS process id, if this handle owns a child.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The error the worker was torn down with, or `ConnectionClosed`.
    pub fn termination_error(&self) -> ServiceError {
        self.shared.channel.termination_error()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.shared.close(ServiceError::Stopped);
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// `program args... --service=<version>` with piped stdio.
fn worker_command(config: &ServiceConfig) -> Command {
    let mut command = Command::new(&config.worker.program);
    command
        .args(&config.worker.args)
        .arg(format!("--service={}", config.version))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(cwd) = &config.worker.cwd {
        command.current_dir(cwd);
    }
    command
}

/// The error for a one-shot worker that sent something other than the
/// single response.
fn unsolicited(packet: Packet) -> ServiceError {
    match packet.body {
        PacketBody::Request { command, .. } => ServiceError::UnexpectedRequest(command),
        PacketBody::Response(_) => ServiceError::UnknownRequestId(packet.id),
    }
}

/// Drain the outbound queue into the worker's stdin.
async fn writer_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => {
                debug!(target: LOG_TARGET, "Writer task cancelled");
                return;
            }

            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        if let Err(e) = write_frame(&mut writer, &frame).await {
            shared.close(ServiceError::Write(Arc::new(e)));
            return;
        }
        trace!(target: LOG_TARGET, "Wrote frame ({} bytes)", frame.len());
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read the worker's stdout and dispatch every complete frame.
async fn reader_loop<R>(mut reader: R, shared: Arc<Shared>, max_frame_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!(target: LOG_TARGET, "Reader task cancelled");
                return;
            }
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!(target: LOG_TARGET, "Worker closed stdout");
                shared.close(ServiceError::ConnectionClosed);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                shared.close(ServiceError::Read(Arc::new(e)));
                return;
            }
        };

        if let Err(e) = dispatch(&mut decoder, &buf[..n], &shared.channel) {
            shared.close(e);
            return;
        }
    }
}

/// Feed one chunk to the decoder, handing each frame to the channel in order.
fn dispatch(decoder: &mut FrameDecoder, chunk: &[u8], channel: &Channel) -> ServiceResult<()> {
    for payload in decoder.push(chunk) {
        channel.on_frame(&payload?)?;
    }
    Ok(())
}

/// Report the child's exit, or kill it on teardown.
async fn exit_watcher(mut child: Child, shared: Arc<Shared>) {
    tokio::select! {
        status = child.wait() => {
            let description = match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            shared.close(ServiceError::Exited(description));
        }
        _ = shared.cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                debug!(target: LOG_TARGET, "Failed to kill worker: {}", e);
            }
        }
    }
}
