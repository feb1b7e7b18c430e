//! Kill child processes when the parent is asked to terminate

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::manager::Manager;

/// Install the termination handlers once per manager
pub(crate) fn install(manager: &Arc<Manager>) {
    if manager.signals_installed.swap(true, Ordering::SeqCst) {
        return;
    }
    let manager = Arc::downgrade(manager);
    tokio::spawn(async move {
        let Some(signal) = wait_for_exit_signal().await else {
            return;
        };
        warn!("Received {}, killing all children", signal);
        if let Some(manager) = manager.upgrade() {
            manager.destroy_all().await;
        }
        info!("Children killed, exiting");
        std::process::exit(0);
    });
}

#[cfg(unix)]
async fn wait_for_exit_signal() -> Option<&'static str> {
    use futures::future::{select_all, FutureExt};
    use tokio::signal::unix::{signal, SignalKind};

    let kinds = [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::hangup(), "SIGHUP"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::user_defined1(), "SIGUSR1"),
        (SignalKind::user_defined2(), "SIGUSR2"),
    ];
    let mut streams = Vec::with_capacity(kinds.len());
    for (kind, name) in kinds {
        match signal(kind) {
            Ok(stream) => streams.push((stream, name)),
            Err(e) => warn!("Cannot listen for {}: {}", name, e),
        }
    }
    if streams.is_empty() {
        return None;
    }

    let waits = streams.iter_mut().map(|(stream, name)| {
        let name: &'static str = *name;
        async move {
            stream.recv().await;
            name
        }
        .boxed()
    });
    let (name, _, _) = select_all(waits).await;
    Some(name)
}

#[cfg(not(unix))]
async fn wait_for_exit_signal() -> Option<&'static str> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("Ctrl-C"),
        Err(e) => {
            warn!("Cannot listen for Ctrl-C: {}", e);
            None
        }
    }
}
