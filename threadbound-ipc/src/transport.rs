//! Transport contract between the manager and a worker, plus the
//! child-process implementation speaking newline-delimited JSON

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::EncodingStrategy;
use crate::error::IpcError;
use crate::protocol::{Message, MessageEnvelope, IPC_PROTOCOL_VERSION};

/// How long a closing worker gets to flush its remaining output
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Something that happened on a worker connection
#[derive(Debug)]
pub enum TransportEvent {
    Message(Message),
    Error(String),
    /// The worker is gone; no further events follow
    Close { code: Option<i32> },
}

/// Sending half of a worker connection
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Encoding the codec must use for messages on this transport
    fn strategy(&self) -> EncodingStrategy;

    /// Queue a message. Messages are delivered in the order they were queued.
    fn send(&self, message: Message) -> Result<(), IpcError>;

    /// Terminate the worker; resolves once it is gone
    async fn kill(&self);

    /// OS process id, when the worker is a separate process
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A freshly started worker: the handle to talk to it and its event stream
pub struct SpawnedTransport {
    pub transport: Arc<dyn WorkerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Serialize a message into one newline-terminated frame
pub fn encode_frame(message: &Message) -> Result<String, IpcError> {
    let envelope = MessageEnvelope::new(message);
    let mut json = serde_json::to_string(&envelope)
        .map_err(|e| IpcError::SerializationError(e.to_string()))?;
    json.push('\n');
    Ok(json)
}

/// Parse one frame produced by [`encode_frame`]
pub fn decode_frame(line: &str) -> Result<Message, IpcError> {
    let envelope: MessageEnvelope<Message> = serde_json::from_str(line.trim_end())
        .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

    if !envelope.is_compatible() {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope.message)
}

/// What to run as a child-process worker
#[derive(Debug, Clone)]
pub struct ChildProcessOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
}

impl ChildProcessOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Worker running as a separate OS process, talking over its stdin/stdout
pub struct ChildProcessTransport {
    pid: Option<u32>,
    outgoing: mpsc::UnboundedSender<String>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl ChildProcessTransport {
    /// Start the worker process. Must be called from within a tokio runtime.
    ///
    /// Dropping the returned transport kills the process.
    pub fn spawn(options: ChildProcessOptions) -> Result<SpawnedTransport, IpcError> {
        let mut command = Command::new(&options.program);
        command
            .args(&options.args)
            .envs(options.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            IpcError::SpawnFailed(format!("{}: {}", options.program.display(), e))
        })?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IpcError::SpawnFailed("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IpcError::SpawnFailed("worker stdout unavailable".to_string()))?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);

        tokio::spawn(write_frames(stdin, outgoing_rx));
        let reader = tokio::spawn(read_frames(stdout, event_tx.clone()));
        tokio::spawn(supervise(child, kill_rx, reader, event_tx, exited_tx));

        debug!("Spawned worker process {:?} ({})", pid, options.program.display());

        let transport = Arc::new(Self {
            pid,
            outgoing,
            kill_tx: Mutex::new(Some(kill_tx)),
            exited,
        });
        Ok(SpawnedTransport { transport, events })
    }
}

#[async_trait]
impl WorkerTransport for ChildProcessTransport {
    fn strategy(&self) -> EncodingStrategy {
        EncodingStrategy::Json
    }

    fn send(&self, message: Message) -> Result<(), IpcError> {
        let frame = encode_frame(&message)?;
        self.outgoing
            .send(frame)
            .map_err(|_| IpcError::ConnectionClosed)
    }

    async fn kill(&self) {
        if let Some(kill_tx) = self.kill_tx.lock().take() {
            let _ = kill_tx.send(());
        }
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn write_frames(mut stdin: ChildStdin, mut outgoing: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = outgoing.recv().await {
        let written = match stdin.write_all(frame.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // The supervisor reports the exit
            debug!("Worker stdin closed: {}", e);
            break;
        }
    }
}

async fn read_frames(stdout: ChildStdout, events: mpsc::UnboundedSender<TransportEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame(&line) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                    }
                    Err(e) => warn!("Ignoring unreadable worker output ({}): {}", e, line),
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    events: mpsc::UnboundedSender<TransportEvent>,
    exited: watch::Sender<bool>,
) {
    // A dropped transport counts as a kill request
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                debug!("Worker already gone: {}", e);
            }
            child.wait().await
        }
    };

    // Deliver whatever the worker wrote before exiting
    if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
        debug!("Worker output not drained before close");
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            let _ = events.send(TransportEvent::Error(e.to_string()));
            None
        }
    };
    debug!("Worker process exited with code {:?}", code);
    let _ = events.send(TransportEvent::Close { code });
    let _ = exited.send(true);
}
