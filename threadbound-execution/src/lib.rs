//! threadbound execution
//!
//! Runs instances of registered classes inside worker threads or child
//! processes and hands out [`ThreadedProxy`] handles to them. The
//! [`ThreadedRuntime`] owns every child it started: placement, crash
//! detection, automatic restarts and shutdown all go through it.

mod builder;
mod child;
pub mod error;
pub mod events;
mod exit;
mod manager;
mod monitor;
pub mod proxy;

use std::collections::HashMap;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use tracing::info;

use threadbound_config::{
    RuntimeConfig, ThreadMode, ThreadboundConfig, ThreadedClassConfig, Validatable,
};
use threadbound_ipc::{MemoryUsage, Value};
use threadbound_worker::ClassRegistry;

use crate::manager::Manager;

// Re-export main types
pub use error::{ThreadedError, ThreadedResult};
pub use events::{EventKind, EventSubscription, LifecycleEvent, Listener};
pub use proxy::ThreadedProxy;

/// Entry point for creating and managing proxied instances
#[derive(Clone)]
pub struct ThreadedRuntime {
    manager: Arc<Manager>,
}

impl ThreadedRuntime {
    pub fn new(config: RuntimeConfig, registry: ClassRegistry) -> ThreadedResult<Self> {
        config.validate()?;
        info!(
            "Starting threadbound runtime ({}, {} modules registered)",
            config.thread_mode,
            registry.modules().count()
        );
        Ok(Self {
            manager: Arc::new(Manager::new(config, Arc::new(registry))),
        })
    }

    pub fn from_config(config: ThreadboundConfig, registry: ClassRegistry) -> ThreadedResult<Self> {
        config.validate_all()?;
        Self::new(config.runtime, registry)
    }

    pub fn thread_mode(&self) -> ThreadMode {
        self.manager.config.thread_mode
    }

    /// Per-proxy options used when `threaded_class` gets `None`
    pub fn default_config(&self) -> &ThreadedClassConfig {
        &self.manager.config.defaults
    }

    /// Construct `export_name` from `module_path` in a worker and return a
    /// proxy to it.
    ///
    /// The class must be registered; nothing is spawned otherwise.
    #[track_caller]
    pub fn threaded_class(
        &self,
        module_path: &str,
        export_name: &str,
        args: Vec<Value>,
        config: Option<ThreadedClassConfig>,
    ) -> impl Future<Output = ThreadedResult<ThreadedProxy>> + Send + 'static {
        let caller = Location::caller();
        let config = config.unwrap_or_else(|| self.manager.config.defaults.clone());
        builder::build_proxy(
            self.manager.clone(),
            caller,
            module_path.to_string(),
            export_name.to_string(),
            args,
            config,
        )
    }

    /// Destroy one proxy; its child is killed when nothing else lives there.
    /// Destroying an already destroyed proxy does nothing.
    pub async fn destroy(&self, proxy: &ThreadedProxy) -> ThreadedResult<()> {
        self.manager.destroy(proxy.instance()).await;
        Ok(())
    }

    /// Kill every child, rejecting whatever is still in flight
    pub async fn destroy_all(&self) {
        self.manager.destroy_all().await;
    }

    pub async fn shutdown(&self) {
        info!(
            "Shutting down threadbound runtime ({} children)",
            self.thread_count()
        );
        self.destroy_all().await;
    }

    /// Number of children, dead ones awaiting a restart included
    pub fn thread_count(&self) -> usize {
        self.manager.thread_count()
    }

    /// Memory usage of every live child, keyed by child id
    pub async fn threads_memory_usage(&self) -> HashMap<String, MemoryUsage> {
        self.manager.threads_memory_usage().await
    }

    /// Restart the child hosting `proxy` and re-create its instances.
    ///
    /// A live child is left alone unless `force` is set.
    pub async fn restart(&self, proxy: &ThreadedProxy, force: bool) -> ThreadedResult<()> {
        let instance = proxy.instance();
        let child = instance.child().ok_or_else(|| {
            ThreadedError::Closed(format!("Instance \"{}\" has been closed", instance.id))
        })?;
        if self.manager.restart_child(&child, force).await? {
            let instances: Vec<_> = child.state.lock().instances.values().cloned().collect();
            for instance in &instances {
                self.manager
                    .emit(EventKind::Restarted, instance, &child.id, "restarted on request");
            }
        }
        Ok(())
    }

    /// Listen for lifecycle events of one proxy
    pub fn on_event<F>(&self, proxy: &ThreadedProxy, kind: EventKind, listener: F) -> EventSubscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.manager
            .events
            .subscribe(proxy.instance_id(), kind, Arc::new(listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use threadbound_ipc::{CallError, Callback};
    use threadbound_worker::{CallContext, ClassDescriptor, ThreadedObject};

    struct Counter {
        count: Mutex<f64>,
        label: Mutex<String>,
    }

    #[async_trait]
    impl ThreadedObject for Counter {
        async fn call(
            &self,
            ctx: &CallContext,
            method: &str,
            args: Vec<Value>,
        ) -> Result<Value, CallError> {
            match method {
                "increment" => {
                    let mut count = self.count.lock();
                    *count += args.first().and_then(Value::as_f64).unwrap_or(1.0);
                    Ok(Value::from(*count))
                }
                "fail" => Err(CallError::new("counter broke")),
                "map" => {
                    let callback = args
                        .first()
                        .and_then(Value::as_callback)
                        .cloned()
                        .ok_or_else(|| CallError::new("map needs a callback"))?;
                    let value = Value::from(*self.count.lock());
                    callback.call(vec![value]).await
                }
                "crash" => {
                    ctx.exit(1);
                    Ok(Value::Undefined)
                }
                _ => Err(CallError::new(format!("no method {}", method))),
            }
        }

        fn get(&self, _ctx: &CallContext, property: &str) -> Result<Value, CallError> {
            match property {
                "label" => Ok(Value::from(self.label.lock().clone())),
                _ => Err(CallError::new("not readable")),
            }
        }

        fn set(&self, _ctx: &CallContext, property: &str, value: Value) -> Result<(), CallError> {
            match (property, value.as_str()) {
                ("label", Some(label)) => {
                    *self.label.lock() = label.to_string();
                    Ok(())
                }
                _ => Err(CallError::new("label must be a string")),
            }
        }
    }

    fn registry() -> ClassRegistry {
        ClassRegistry::new().with_class(
            "test/counter",
            ClassDescriptor::new("Counter")
                .method("increment")
                .method("fail")
                .method("map")
                .method("crash")
                .field("label"),
            |_, args| {
                let start = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                Ok(Arc::new(Counter {
                    count: Mutex::new(start),
                    label: Mutex::new("counter".to_string()),
                }) as Arc<dyn ThreadedObject>)
            },
        )
    }

    fn runtime(mode: ThreadMode) -> ThreadedRuntime {
        let config = RuntimeConfig::default()
            .with_thread_mode(mode)
            .with_handle_exit_signals(false);
        ThreadedRuntime::new(config, registry()).unwrap()
    }

    fn quiet() -> ThreadedClassConfig {
        ThreadedClassConfig::default().with_freeze_limit(None)
    }

    #[tokio::test]
    async fn test_call_and_properties_in_process() {
        let runtime = runtime(ThreadMode::InProcess);
        let counter = runtime
            .threaded_class("test/counter", "Counter", vec![Value::from(10)], Some(quiet()))
            .await
            .unwrap();

        assert_eq!(counter.class_name(), "Counter");
        assert!(counter.has_member("increment"));
        assert_eq!(
            counter.call("increment", vec![Value::from(5)]).await.unwrap().as_f64(),
            Some(15.0)
        );

        assert_eq!(counter.get("label").await.unwrap().as_str(), Some("counter"));
        let stored = counter
            .set_and_wait("label", Value::from("kitchen"))
            .await
            .unwrap();
        assert_eq!(stored.as_str(), Some("kitchen"));
        assert_eq!(counter.get("label").await.unwrap().as_str(), Some("kitchen"));

        runtime.destroy(&counter).await.unwrap();
        assert_eq!(runtime.thread_count(), 0);
    }

    #[tokio::test]
    async fn test_errors_carry_call_site() {
        let runtime = runtime(ThreadMode::WorkerThreads);
        let counter = runtime
            .threaded_class("test/counter", "Counter", Vec::new(), Some(quiet()))
            .await
            .unwrap();

        let err = counter.call("fail", Vec::new()).await.unwrap_err();
        match &err {
            ThreadedError::Invocation(e) => {
                assert_eq!(e.message(), "counter broke");
                assert!(e.frames().iter().any(|frame| frame.contains("lib.rs")));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = counter.call("missing", Vec::new()).await.unwrap_err();
        assert!(matches!(err, ThreadedError::UnknownMember { .. }));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_callback_runs_in_parent() {
        let runtime = runtime(ThreadMode::WorkerThreads);
        let counter = runtime
            .threaded_class("test/counter", "Counter", vec![Value::from(2)], Some(quiet()))
            .await
            .unwrap();

        let double = Callback::from_fn(|args| {
            let value = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            Ok(Value::from(value * 2.0))
        });
        let result = counter.call("map", vec![Value::from(double)]).await.unwrap();
        assert_eq!(result.as_f64(), Some(4.0));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_class_spawns_nothing() {
        let runtime = runtime(ThreadMode::WorkerThreads);
        let err = runtime
            .threaded_class("test/garden", "Counter", Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadedError::Resolution(_)));
        assert_eq!(runtime.thread_count(), 0);

        let err = runtime
            .threaded_class("", "Counter", Vec::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadedError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_pooled_placement() {
        let runtime = runtime(ThreadMode::WorkerThreads);
        let half = quiet().with_thread_usage(0.5);

        let a = runtime
            .threaded_class("test/counter", "Counter", Vec::new(), Some(half.clone()))
            .await
            .unwrap();
        let b = runtime
            .threaded_class("test/counter", "Counter", Vec::new(), Some(half.clone()))
            .await
            .unwrap();
        let c = runtime
            .threaded_class("test/counter", "Counter", Vec::new(), Some(half))
            .await
            .unwrap();

        assert_eq!(a.child_id(), b.child_id());
        assert_ne!(a.child_id(), c.child_id());
        assert_eq!(runtime.thread_count(), 2);

        // b survives a; their child stays up
        runtime.destroy(&a).await.unwrap();
        assert_eq!(runtime.thread_count(), 2);
        assert_eq!(
            b.call("increment", Vec::new()).await.unwrap().as_f64(),
            Some(1.0)
        );
        assert!(a.call("increment", Vec::new()).await.unwrap_err().is_closed());

        runtime.destroy(&b).await.unwrap();
        runtime.destroy(&b).await.unwrap();
        assert_eq!(runtime.thread_count(), 1);
        runtime.shutdown().await;
        assert_eq!(runtime.thread_count(), 0);
    }

    #[tokio::test]
    async fn test_named_thread_shared() {
        let runtime = runtime(ThreadMode::WorkerThreads);
        let pinned = quiet().with_thread_id("kitchen");
        let a = runtime
            .threaded_class("test/counter", "Counter", Vec::new(), Some(pinned.clone()))
            .await
            .unwrap();
        let b = runtime
            .threaded_class("test/counter", "Counter", Vec::new(), Some(pinned))
            .await
            .unwrap();
        assert_eq!(a.child_id().as_deref(), Some("kitchen"));
        assert_eq!(b.child_id().as_deref(), Some("kitchen"));
        assert_eq!(runtime.thread_count(), 1);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_rejects_and_auto_restarts() {
        let runtime = runtime(ThreadMode::WorkerThreads);
        let config = quiet().with_auto_restart(true);
        let counter = runtime
            .threaded_class("test/counter", "Counter", vec![Value::from(1)], Some(config))
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let closed_tx = tx.clone();
        let _closed = runtime.on_event(&counter, EventKind::ThreadClosed, move |event| {
            let _ = closed_tx.send(event.kind);
        });
        let _restarted = runtime.on_event(&counter, EventKind::Restarted, move |event| {
            let _ = tx.send(event.kind);
        });

        let err = counter.call("crash", Vec::new()).await.unwrap_err();
        assert!(err.is_closed(), "unexpected error {:?}", err);

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first, Some(EventKind::ThreadClosed));
        assert_eq!(second, Some(EventKind::Restarted));

        // Constructor arguments are replayed; state is not
        assert_eq!(
            counter.call("increment", Vec::new()).await.unwrap().as_f64(),
            Some(2.0)
        );
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_proxy_value_round_trip() {
        let runtime = runtime(ThreadMode::InProcess);
        let counter = runtime
            .threaded_class("test/counter", "Counter", Vec::new(), Some(quiet()))
            .await
            .unwrap();
        let value = counter.to_value();
        let back = ThreadedProxy::from_value(&value).unwrap();
        assert!(back.ptr_eq(&counter));
        assert!(ThreadedProxy::from_value(&Value::from(1)).is_none());
        runtime.shutdown().await;
    }
}
