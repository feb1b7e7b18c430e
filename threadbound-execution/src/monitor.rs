//! Freeze detection: ping each instance and treat silence as a crash

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use threadbound_ipc::InstanceCommand;

use crate::child::ChildInstance;
use crate::manager::Manager;

/// Start pinging `instance` every `freeze_limit`; a ping left unanswered for
/// that long marks its child as frozen
pub(crate) fn start_monitoring(manager: &Arc<Manager>, instance: &Arc<ChildInstance>) {
    let Some(limit) = instance.config.freeze_limit else {
        return;
    };
    let handle = tokio::spawn(watch(
        Arc::downgrade(manager),
        Arc::downgrade(instance),
        limit,
    ));
    if let Some(previous) = instance.monitor.lock().replace(handle) {
        previous.abort();
    }
}

async fn watch(manager: Weak<Manager>, instance: Weak<ChildInstance>, limit: Duration) {
    let mut interval = tokio::time::interval(limit);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let (Some(manager), Some(instance)) = (manager.upgrade(), instance.upgrade()) else {
            break;
        };
        let Some(child) = instance.child() else {
            break;
        };
        // Crashed or restarting children are handled elsewhere
        if !child.is_usable() || !instance.is_initialized() {
            continue;
        }

        let generation = child.state.lock().generation;
        let rx = match manager.send_to_instance(&instance, InstanceCommand::Ping, true) {
            Ok(rx) => rx,
            Err(e) => {
                debug!("Ping of {} not sent: {}", instance.id, e);
                continue;
            }
        };
        if tokio::time::timeout(limit, rx).await.is_err() {
            warn!(
                "Instance {} did not answer a ping within {}ms",
                instance.id,
                limit.as_millis()
            );
            let reason = format!(
                "child {} froze (no ping reply within {}ms)",
                child.id,
                limit.as_millis()
            );
            tokio::spawn(async move {
                manager.child_has_crashed(&child, generation, reason).await
            });
        }
    }
}
