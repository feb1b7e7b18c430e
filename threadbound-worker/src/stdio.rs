//! Entry point for worker executables talking to their parent over stdio

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use threadbound_ipc::{decode_frame, encode_frame, EncodingStrategy, IpcError};

use crate::class::ClassRegistry;
use crate::dispatcher::{Dispatcher, Outbound, WorkerHost};

/// Set to `1` in the environment of every child-process worker
pub const WORKER_ENV_VAR: &str = "THREADBOUND_WORKER";

/// Pid of the process that spawned the worker
pub const PARENT_PID_ENV_VAR: &str = "THREADBOUND_PARENT_PID";

const ORPHAN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Whether this process was started as a child-process worker
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV_VAR)
        .map(|value| value == "1")
        .unwrap_or(false)
}

/// Serve instance commands read from stdin until the parent goes away.
///
/// Stdout carries the protocol, so logging must be configured to write to
/// stderr before calling this.
pub async fn run_stdio_worker(registry: Arc<ClassRegistry>) -> Result<(), IpcError> {
    info!("Starting worker process {}", std::process::id());

    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = outgoing_rx.recv().await {
            let written = match stdout.write_all(frame.as_bytes()).await {
                Ok(()) => stdout.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                error!("Failed to write to parent: {}", e);
                break;
            }
        }
    });

    let outbound: Outbound = Arc::new(move |message| {
        let frame = encode_frame(&message)?;
        outgoing.send(frame).map_err(|_| IpcError::ConnectionClosed)
    });

    let mut host = WorkerHost::new(|code| {
        info!("Worker exiting with code {}", code);
        std::process::exit(code);
    });
    match std::env::var(PARENT_PID_ENV_VAR)
        .ok()
        .and_then(|pid| pid.parse::<u32>().ok())
    {
        Some(parent_pid) => spawn_orphan_monitor(parent_pid),
        None => host = host.with_parent_watch(spawn_orphan_monitor),
    }

    let dispatcher = Dispatcher::new(registry, EncodingStrategy::Json, outbound, host);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_frame(&line) {
                    Ok(message) => dispatcher.handle(message),
                    Err(e) => warn!("Discarding unreadable frame: {}", e),
                }
            }
            Ok(None) => {
                debug!("Parent closed the connection");
                break Ok(());
            }
            Err(e) => break Err(IpcError::from(e)),
        }
    };

    dispatcher.shutdown();
    info!("Worker process {} shutting down", std::process::id());
    result
}

/// Exit once the parent process disappears
fn spawn_orphan_monitor(parent_pid: u32) {
    debug!("Watching parent process {}", parent_pid);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ORPHAN_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            if !parent_alive(parent_pid) {
                warn!("Parent process {} is gone, exiting", parent_pid);
                std::process::exit(0);
            }
        }
    });
}

#[cfg(unix)]
fn parent_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match i32::try_from(pid) {
        // Signal 0 only checks for existence
        Ok(raw) => !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH)),
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn parent_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
