//! Workers living inside the parent process: on a dedicated OS thread, or
//! directly on the caller's runtime when multithreading is disabled

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use threadbound_ipc::{
    EncodingStrategy, IpcError, Message, SpawnedTransport, TransportEvent, WorkerTransport,
};

use crate::class::ClassRegistry;
use crate::dispatcher::{Dispatcher, Outbound, WorkerHost};

struct ChannelState {
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
}

impl ChannelState {
    /// Stop the worker and report the close, once
    fn close(&self, code: Option<i32>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.send_replace(true);
        let _ = self.events.send(TransportEvent::Close { code });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Transport to a worker hosted in this process; messages move by value
pub struct ChannelTransport {
    strategy: EncodingStrategy,
    inbox: mpsc::UnboundedSender<Message>,
    state: Arc<ChannelState>,
}

#[async_trait]
impl WorkerTransport for ChannelTransport {
    fn strategy(&self) -> EncodingStrategy {
        self.strategy
    }

    fn send(&self, message: Message) -> Result<(), IpcError> {
        if self.state.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }
        self.inbox
            .send(message)
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// A thread blocked inside a method cannot be interrupted; it is
    /// abandoned and exits once it yields
    async fn kill(&self) {
        self.state.close(None);
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.state.stop.send_replace(true);
    }
}

struct WorkerSide {
    inbox: mpsc::UnboundedReceiver<Message>,
    state: Arc<ChannelState>,
}

fn channel_pair(strategy: EncodingStrategy) -> (SpawnedTransport, WorkerSide) {
    let (events_tx, events) = mpsc::unbounded_channel();
    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    let (stop, _) = watch::channel(false);
    let state = Arc::new(ChannelState {
        events: events_tx,
        closed: AtomicBool::new(false),
        stop,
    });

    let transport = Arc::new(ChannelTransport {
        strategy,
        inbox: inbox_tx,
        state: state.clone(),
    });
    (
        SpawnedTransport { transport, events },
        WorkerSide { inbox, state },
    )
}

fn channel_dispatcher(
    registry: Arc<ClassRegistry>,
    strategy: EncodingStrategy,
    state: &Arc<ChannelState>,
) -> Dispatcher {
    let out_state = state.clone();
    let outbound: Outbound = Arc::new(move |message| {
        if out_state.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }
        out_state
            .events
            .send(TransportEvent::Message(message))
            .map_err(|_| IpcError::ConnectionClosed)
    });

    let exit_state = state.clone();
    let host = WorkerHost::new(move |code| {
        debug!("In-process worker exiting with code {}", code);
        exit_state.close(Some(code));
    });

    Dispatcher::new(registry, strategy, outbound, host)
}

async fn serve(dispatcher: Dispatcher, side: WorkerSide) {
    let WorkerSide { mut inbox, state } = side;
    let mut stop = state.stop.subscribe();
    loop {
        if state.is_closed() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            message = inbox.recv() => match message {
                Some(message) => dispatcher.handle(message),
                None => break,
            },
        }
    }
    dispatcher.shutdown();
    state.close(None);
}

/// Start a worker on its own OS thread with a single-threaded runtime
pub fn spawn_thread_worker(
    registry: Arc<ClassRegistry>,
    name: &str,
) -> Result<SpawnedTransport, IpcError> {
    let strategy = EncodingStrategy::StructuredClone;
    let (spawned, side) = channel_pair(strategy);

    std::thread::Builder::new()
        .name(format!("threadbound-{}", name))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Failed to start worker runtime: {}", e);
                    let _ = side.state.events.send(TransportEvent::Error(e.to_string()));
                    side.state.close(None);
                    return;
                }
            };
            runtime.block_on(async move {
                let dispatcher = channel_dispatcher(registry, strategy, &side.state);
                serve(dispatcher, side).await;
            });
        })
        .map_err(|e| IpcError::SpawnFailed(e.to_string()))?;

    Ok(spawned)
}

/// Start a worker on the current runtime, sharing values by reference
pub fn spawn_in_process_worker(registry: Arc<ClassRegistry>) -> Result<SpawnedTransport, IpcError> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| IpcError::SpawnFailed(format!("no tokio runtime: {}", e)))?;

    let strategy = EncodingStrategy::InProcess;
    let (spawned, side) = channel_pair(strategy);
    let dispatcher = channel_dispatcher(registry, strategy, &side.state);
    runtime.spawn(serve(dispatcher, side));
    Ok(spawned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassDescriptor, ThreadedObject};
    use crate::dispatcher::CallContext;
    use std::time::Duration;
    use threadbound_ipc::{
        CallError, InitConfig, InitRequest, InstanceCommand, InstanceMessage, ReplyBody, Value,
    };

    struct Echo;

    #[async_trait]
    impl ThreadedObject for Echo {
        async fn call(
            &self,
            ctx: &CallContext,
            method: &str,
            args: Vec<Value>,
        ) -> Result<Value, CallError> {
            match method {
                "echo" => Ok(args.into_iter().next().unwrap_or_default()),
                "quit" => {
                    ctx.exit(3);
                    Ok(Value::Undefined)
                }
                _ => Err(CallError::new("unknown")),
            }
        }
    }

    fn registry() -> Arc<ClassRegistry> {
        Arc::new(ClassRegistry::new().with_class(
            "test/echo",
            ClassDescriptor::new("Echo").method("echo").method("quit"),
            |_, _| Ok(Arc::new(Echo) as Arc<dyn ThreadedObject>),
        ))
    }

    fn init() -> Message {
        Message::Instance(InstanceMessage {
            cmd_id: 0,
            instance_id: "echo_1".to_string(),
            cmd: InstanceCommand::Init(InitRequest {
                module_path: "test/echo".to_string(),
                export_name: "Echo".to_string(),
                args: Vec::new(),
                config: InitConfig::default(),
                parent_pid: std::process::id(),
            }),
        })
    }

    async fn next(spawned: &mut SpawnedTransport) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), spawned.events.recv())
            .await
            .expect("timed out")
            .expect("events closed")
    }

    #[tokio::test]
    async fn test_thread_worker_replies_and_closes_on_kill() {
        let mut spawned = spawn_thread_worker(registry(), "echo").unwrap();
        assert_eq!(spawned.transport.strategy(), EncodingStrategy::StructuredClone);

        spawned.transport.send(init()).unwrap();
        match next(&mut spawned).await {
            TransportEvent::Message(Message::Instance(InstanceMessage {
                cmd: InstanceCommand::Reply(reply),
                ..
            })) => assert!(matches!(reply.reply, Some(ReplyBody::Props(_)))),
            other => panic!("unexpected event {:?}", other),
        }

        spawned.transport.kill().await;
        assert!(matches!(
            next(&mut spawned).await,
            TransportEvent::Close { code: None }
        ));
        assert!(spawned.transport.send(init()).is_err());
    }

    #[tokio::test]
    async fn test_in_process_worker_exit_reports_code() {
        let mut spawned = spawn_in_process_worker(registry()).unwrap();
        assert_eq!(spawned.transport.strategy(), EncodingStrategy::InProcess);

        spawned.transport.send(init()).unwrap();
        assert!(matches!(next(&mut spawned).await, TransportEvent::Message(_)));

        spawned
            .transport
            .send(Message::Instance(InstanceMessage {
                cmd_id: 1,
                instance_id: "echo_1".to_string(),
                cmd: InstanceCommand::Function {
                    fcn: "quit".to_string(),
                    args: Vec::new(),
                },
            }))
            .unwrap();

        // The reply may or may not make it out before the close
        loop {
            match next(&mut spawned).await {
                TransportEvent::Close { code } => {
                    assert_eq!(code, Some(3));
                    break;
                }
                TransportEvent::Message(_) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
