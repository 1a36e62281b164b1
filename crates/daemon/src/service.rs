//! Harness interface server
//!
//! Accepts client connections on a Unix socket. Each connection is bound into
//! the runner through the connection factory and then speaks the line protocol
//! from [`sky_harness_common::protocol`].

use crate::bindings::HarnessBinding;
use crate::report::FinishedRun;
use crate::runner::RunnerHandle;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use sky_harness_common::protocol::{
    Command, ErrorBody, Event, Greeting, Request, ServerMessage, MAX_FRAME_LENGTH,
};
use sky_harness_common::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Bound harness socket, ready to serve
pub struct HarnessService {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl HarnessService {
    /// Bind the socket, replacing a stale one left by a previous daemon
    pub fn bind(socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            debug!("Removing stale socket {}", socket_path.display());
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        info!("Harness interface listening on {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(self, runner: RunnerHandle, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let runner = runner.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, runner).await {
                            debug!("Connection closed: {}", e);
                        }
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Could not remove {}: {}", self.socket_path.display(), e);
        }
        info!("Harness interface stopped");
        Ok(())
    }
}

/// Bind and serve in one step
pub async fn serve(socket_path: PathBuf, runner: RunnerHandle, shutdown: CancellationToken) -> Result<()> {
    HarnessService::bind(socket_path)?.serve(runner, shutdown).await
}

fn peer_label(stream: &UnixStream) -> String {
    match stream.peer_cred() {
        Ok(cred) => match cred.pid() {
            Some(pid) => format!("pid:{}", pid),
            None => format!("uid:{}", cred.uid()),
        },
        Err(_) => "unix".to_string(),
    }
}

/// One request line, or the reason it could not be decoded
type Frame = std::result::Result<String, String>;

/// Line codec that reports undecodable lines as frames instead of errors.
///
/// `LinesCodec` already skips the rest of an over-long line, so decoding can
/// continue with the next one.
pub struct RequestCodec {
    lines: LinesCodec,
}

impl RequestCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }

    fn recover(
        result: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<Frame>, LinesCodecError> {
        match result {
            Ok(line) => Ok(line.map(Ok)),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Ok(Some(Err("request exceeds maximum line length".to_string())))
            }
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(Err(format!("request is not valid UTF-8: {}", e))))
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for RequestCodec {
    type Item = Frame;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Frame>, LinesCodecError> {
        Self::recover(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Frame>, LinesCodecError> {
        Self::recover(self.lines.decode_eof(buf))
    }
}

impl Encoder<String> for RequestCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> std::result::Result<(), LinesCodecError> {
        self.lines.encode(line, dst)
    }
}

type Connection = Framed<UnixStream, RequestCodec>;

async fn send(conn: &mut Connection, message: &ServerMessage) -> Result<()> {
    let line = serde_json::to_string(message)?;
    trace!("Harness reply: {}", line);
    conn.send(line)
        .await
        .map_err(|e| Error::Protocol(format!("Failed to write: {}", e)))
}

async fn handle_connection(stream: UnixStream, runner: RunnerHandle) -> Result<()> {
    let peer = peer_label(&stream);
    let binding = runner.create(peer.clone()).await?;
    debug!("Client {} bound as {}", peer, binding.id());

    let mut conn = Framed::new(stream, RequestCodec::new(MAX_FRAME_LENGTH));
    send(
        &mut conn,
        &ServerMessage::Greeting {
            greeting: Greeting {
                version: sky_harness_common::VERSION.to_string(),
                binding: binding.id().to_string(),
            },
        },
    )
    .await?;

    let mut reports: Option<broadcast::Receiver<FinishedRun>> = None;

    loop {
        tokio::select! {
            line = conn.next() => {
                let Some(frame) = line else { break };
                let frame = frame.map_err(|e| Error::Protocol(e.to_string()))?;
                let line = match frame {
                    Ok(line) => line,
                    Err(reason) => {
                        debug!("Undecodable request from {}: {}", binding.id(), reason);
                        send(&mut conn, &protocol_error(format!("Malformed request: {}", reason))).await?;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                trace!("Harness request from {}: {}", binding.id(), line);

                let reply = handle_line(&binding, &line, &mut reports).await;
                send(&mut conn, &reply).await?;
            }
            finished = next_report(&mut reports) => {
                match finished {
                    Ok(finished) => {
                        let event = ServerMessage::Event(Event::RunFinished(finished.report));
                        send(&mut conn, &event).await?;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Binding {} missed {} reports", binding.id(), missed);
                    }
                    Err(RecvError::Closed) => reports = None,
                }
            }
        }
    }

    debug!("Client {} ({}) disconnected", peer, binding.id());
    Ok(())
}

async fn next_report(
    reports: &mut Option<broadcast::Receiver<FinishedRun>>,
) -> std::result::Result<FinishedRun, RecvError> {
    match reports {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_line(
    binding: &HarnessBinding,
    line: &str,
    reports: &mut Option<broadcast::Receiver<FinishedRun>>,
) -> ServerMessage {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            debug!("Malformed request: {}", e);
            return protocol_error(format!("Malformed request: {}", e));
        }
    };

    let id = request.id;
    debug!("{} from binding {}", request.command.name(), binding.id());

    match execute(binding, request.command, reports).await {
        Ok(value) => ServerMessage::Return { id, value },
        Err(e) => ServerMessage::Error {
            id: Some(id),
            error: ErrorBody::from(&e),
        },
    }
}

async fn execute(
    binding: &HarnessBinding,
    command: Command,
    reports: &mut Option<broadcast::Receiver<FinishedRun>>,
) -> Result<serde_json::Value> {
    match command {
        Command::SetPackageRoot { root } => {
            binding.set_package_root(root)?;
            Ok(serde_json::Value::Null)
        }
        Command::Start { test } => to_value(binding.start(test).await?),
        Command::OnTestComplete { result_text, pixels } => {
            to_value(binding.on_test_complete(result_text, pixels).await?)
        }
        Command::DispatchInputEvent { event } => to_value(binding.dispatch_input_event(event).await?),
        Command::Status => to_value(binding.status().await?),
        Command::Subscribe => {
            if reports.is_none() {
                *reports = Some(binding.subscribe());
            }
            Ok(serde_json::Value::Null)
        }
    }
}

/// Reply to a line that could not be parsed as a request
fn protocol_error(desc: String) -> ServerMessage {
    ServerMessage::Error {
        id: None,
        error: ErrorBody::from(&Error::Protocol(desc)),
    }
}

fn to_value<T: Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}
