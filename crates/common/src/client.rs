//! Harness client implementation
//!
//! Provides async communication with the harness daemon via Unix socket.

use crate::protocol::{Command, Event, Greeting, Request, ServerMessage};
use crate::types::{DispatchOutcome, InputEvent, RunPhase, RunReport, RunnerStatus, SingleTest};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Client for one binding to the harness interface
pub struct HarnessClient {
    socket_path: PathBuf,
    greeting: Greeting,
    stream: Mutex<BufReader<UnixStream>>,
    /// Events that arrived while waiting for a command response
    events: Mutex<VecDeque<Event>>,
    next_id: AtomicU64,
}

impl HarnessClient {
    /// Connect to the harness socket and read the greeting
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            Error::Protocol(format!("Failed to connect to {}: {}", socket_path.display(), e))
        })?;

        let mut reader = BufReader::new(stream);

        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(Error::Protocol("Connection closed before greeting".to_string()));
        }
        trace!("Harness greeting: {}", line.trim());

        let greeting = match serde_json::from_str(&line)
            .map_err(|e| Error::Protocol(format!("Invalid greeting: {}", e)))?
        {
            ServerMessage::Greeting { greeting } => greeting,
            other => {
                return Err(Error::Protocol(format!(
                    "Expected greeting, got {:?}",
                    other
                )))
            }
        };

        debug!(
            "Connected to harness {} as binding {}",
            socket_path.display(),
            greeting.binding
        );

        Ok(Self {
            socket_path,
            greeting,
            stream: Mutex::new(reader),
            events: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Socket this client is connected to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binding identifier assigned by the daemon
    pub fn binding_id(&self) -> &str {
        &self.greeting.binding
    }

    /// Daemon version from the greeting
    pub fn server_version(&self) -> &str {
        &self.greeting.version
    }

    /// Execute a harness command
    pub async fn execute<R: DeserializeOwned>(&self, command: Command) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request { id, command };

        let mut reader = self.stream.lock().await;
        let line = serde_json::to_string(&request)?;
        trace!("Harness command: {}", line);

        let writer = reader.get_mut();
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        // Read until our response, queueing events
        loop {
            match read_message(&mut reader).await? {
                ServerMessage::Return { id: got, value } if got == id => {
                    return Ok(serde_json::from_value(value)?);
                }
                ServerMessage::Error { id: got, error } if got == Some(id) || got.is_none() => {
                    return Err(error.into());
                }
                ServerMessage::Event(event) => {
                    self.events.lock().await.push_back(event);
                }
                other => {
                    trace!("Skipping unrelated message: {:?}", other);
                }
            }
        }
    }

    /// Wait for the next event on a subscribed connection
    pub async fn next_event(&self) -> Result<Event> {
        if let Some(event) = self.events.lock().await.pop_front() {
            return Ok(event);
        }

        let mut reader = self.stream.lock().await;
        loop {
            match read_message(&mut reader).await? {
                ServerMessage::Event(event) => return Ok(event),
                other => trace!("Skipping non-event message: {:?}", other),
            }
        }
    }

    /// Wait for the next finished run on a subscribed connection
    pub async fn next_report(&self) -> Result<RunReport> {
        match self.next_event().await? {
            Event::RunFinished(report) => Ok(report),
        }
    }

    /// Set the asset-resolution root for subsequent runs
    pub async fn set_package_root(&self, root: impl Into<String>) -> Result<()> {
        self.execute(Command::SetPackageRoot { root: root.into() }).await
    }

    /// Start the runner, optionally with a test
    pub async fn start(&self, test: Option<SingleTest>) -> Result<RunPhase> {
        self.execute(Command::Start { test }).await
    }

    /// Report completion of the current run
    pub async fn on_test_complete(
        &self,
        result_text: impl Into<String>,
        pixels: Vec<u8>,
    ) -> Result<RunReport> {
        self.execute(Command::OnTestComplete {
            result_text: result_text.into(),
            pixels,
        })
        .await
    }

    /// Forward an input event to the active engine
    pub async fn dispatch_input_event(&self, event: InputEvent) -> Result<DispatchOutcome> {
        self.execute(Command::DispatchInputEvent { event }).await
    }

    /// Query runner state
    pub async fn status(&self) -> Result<RunnerStatus> {
        self.execute(Command::Status).await
    }

    /// Receive `run_finished` events on this connection
    pub async fn subscribe(&self) -> Result<()> {
        self.execute(Command::Subscribe).await
    }
}

async fn read_message(reader: &mut BufReader<UnixStream>) -> Result<ServerMessage> {
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if read == 0 {
        return Err(Error::Protocol("Connection closed by harness".to_string()));
    }
    trace!("Harness message: {}", line.trim());

    serde_json::from_str(&line).map_err(|e| Error::Protocol(format!("Invalid message: {}", e)))
}

/// Helper to wait until the harness socket accepts connections
pub async fn wait_for_harness(socket_path: &Path, attempts: usize) -> Result<HarnessClient> {
    let mut last_error = None;

    for _ in 0..attempts {
        if socket_path.exists() {
            match HarnessClient::connect(socket_path).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    trace!("Harness not ready: {}", e);
                    last_error = Some(e);
                }
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    Err(last_error.unwrap_or_else(|| {
        Error::Protocol(format!("Harness socket {} never appeared", socket_path.display()))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    async fn serve_once(listener: UnixListener, replies: Vec<&'static str>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        reader
            .get_mut()
            .write_all(b"{\"greeting\":{\"version\":\"test\",\"binding\":\"b-1\"}}\n")
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        for reply in replies {
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            reader.get_mut().write_all(b"\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_execute_queues_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let event = r#"{"event":"run_finished","data":{"run_id":1,"test":{"path":"a.test"},"verdict":{"kind":"passed"},"result_text":"PASS","pixels_len":0,"finished_at":"2026-01-01T00:00:00Z"}}"#;
        let server = tokio::spawn(serve_once(
            listener,
            vec![event, r#"{"id":1,"return":null}"#],
        ));

        let client = HarnessClient::connect(&path).await.unwrap();
        assert_eq!(client.binding_id(), "b-1");

        client.set_package_root("/assets").await.unwrap();
        let report = client.next_report().await.unwrap();
        assert_eq!(report.result_text, "PASS");
        assert!(report.is_success());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(serve_once(
            listener,
            vec![r#"{"id":1,"error":{"class":"LogicError","desc":"no test running"}}"#],
        ));

        let client = HarnessClient::connect(&path).await.unwrap();
        let err = client.on_test_complete("PASS", Vec::new()).await.unwrap_err();
        assert!(err.is_logic_error());

        server.await.unwrap();
    }
}
