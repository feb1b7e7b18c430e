//! Parent-side stand-in for an object living in a child

use std::fmt;
use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use tracing::warn;

use threadbound_ipc::{InstanceCommand, PropertyDescriptor, Value};

use crate::child::{ChildInstance, ProxyToken};
use crate::error::{ThreadedError, ThreadedResult};
use crate::events::EventKind;
use crate::manager::Manager;

pub(crate) struct ProxyInner {
    pub manager: Arc<Manager>,
    pub instance: Arc<ChildInstance>,
    members: Vec<PropertyDescriptor>,
}

/// Handle to a proxied instance.
///
/// Exposes exactly the members of the property manifest the worker returned.
/// Cloning is cheap and yields the same proxy.
#[derive(Clone)]
pub struct ThreadedProxy {
    inner: Arc<ProxyInner>,
}

impl ThreadedProxy {
    pub(crate) fn new(
        manager: Arc<Manager>,
        instance: Arc<ChildInstance>,
        manifest: Vec<PropertyDescriptor>,
    ) -> Self {
        let mut members: Vec<PropertyDescriptor> = Vec::with_capacity(manifest.len());
        for descriptor in manifest {
            if !members.iter().any(|member| member.key == descriptor.key) {
                members.push(descriptor);
            }
        }

        let inner = Arc::new(ProxyInner {
            manager,
            instance,
            members,
        });
        let _ = inner.instance.token.proxy.set(Arc::downgrade(&inner));
        Self { inner }
    }

    pub(crate) fn instance(&self) -> &Arc<ChildInstance> {
        &self.inner.instance
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance.id
    }

    /// Name of the class this proxy was built from
    pub fn class_name(&self) -> &str {
        &self.inner.instance.export_name
    }

    /// Id of the child currently hosting the instance
    pub fn child_id(&self) -> Option<String> {
        self.inner.instance.child().map(|child| child.id.clone())
    }

    pub fn manifest(&self) -> &[PropertyDescriptor] {
        &self.inner.members
    }

    pub fn has_member(&self, key: &str) -> bool {
        self.member(key).is_ok()
    }

    fn member(&self, key: &str) -> ThreadedResult<&PropertyDescriptor> {
        self.inner
            .members
            .iter()
            .find(|member| member.key == key)
            .ok_or_else(|| ThreadedError::UnknownMember {
                instance_id: self.inner.instance.id.clone(),
                member: key.to_string(),
            })
    }

    /// Call a method of the remote instance.
    ///
    /// Errors raised in the worker keep their remote frames and get the call
    /// site appended.
    #[track_caller]
    pub fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = ThreadedResult<Value>> + Send + 'static {
        let location = Location::caller();
        let proxy = self.clone();
        let method = method.to_string();
        async move {
            if !proxy.member(&method)?.is_function() {
                return Err(ThreadedError::InvalidArgument(format!(
                    "\"{}\" of instance {} is not a method",
                    method,
                    proxy.instance_id()
                )));
            }
            proxy.invoke(method, args, location).await
        }
    }

    /// Read a property of the remote instance
    #[track_caller]
    pub fn get(&self, property: &str) -> impl Future<Output = ThreadedResult<Value>> + Send + 'static {
        let location = Location::caller();
        let proxy = self.clone();
        let property = property.to_string();
        async move {
            let member = proxy.member(&property)?;
            if member.is_function() || !member.can_read() {
                return Err(ThreadedError::InvalidArgument(format!(
                    "Property \"{}\" of instance {} is not readable",
                    property,
                    proxy.instance_id()
                )));
            }
            proxy.invoke(property, Vec::new(), location).await
        }
    }

    /// Assign a property without waiting for the worker.
    ///
    /// Failures reported by the worker are logged and emitted as a warning
    /// event; only errors detected before sending are returned.
    pub fn set(&self, property: &str, value: Value) -> ThreadedResult<()> {
        self.check_writable(property)?;
        let manager = self.inner.manager.clone();
        let instance = self.inner.instance.clone();

        let value = manager.encode(&instance, value)?;
        let rx = manager.send_to_instance(
            &instance,
            InstanceCommand::Set {
                property: property.to_string(),
                value,
            },
            true,
        )?;

        let property = property.to_string();
        tokio::spawn(async move {
            let failure = match rx.await {
                Ok(Ok(reply)) => reply.error,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("request was dropped".to_string()),
            };
            if let Some(error) = failure {
                let message = format!("Setting \"{}\" failed: {}", property, error);
                warn!("Instance {}: {}", instance.id, message);
                let child_id = instance.child().map(|child| child.id.clone()).unwrap_or_default();
                manager.emit(EventKind::Warning, &instance, &child_id, &message);
            }
        });
        Ok(())
    }

    /// Assign a property and wait for the value the worker stored
    #[track_caller]
    pub fn set_and_wait(
        &self,
        property: &str,
        value: Value,
    ) -> impl Future<Output = ThreadedResult<Value>> + Send + 'static {
        let location = Location::caller();
        let proxy = self.clone();
        let property = property.to_string();
        async move {
            proxy.check_writable(&property)?;
            let manager = &proxy.inner.manager;
            let instance = &proxy.inner.instance;
            let value = manager.encode(instance, value)?;
            let reply = manager
                .request(instance, InstanceCommand::Set { property, value })
                .await?;
            manager
                .value_from_reply(instance, reply)
                .map_err(|e| with_call_site(e, location))
        }
    }

    fn check_writable(&self, property: &str) -> ThreadedResult<()> {
        let member = self.member(property)?;
        if member.is_function() || !member.can_write() {
            return Err(ThreadedError::InvalidArgument(format!(
                "Property \"{}\" of instance {} is not writable",
                property,
                self.instance_id()
            )));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        name: String,
        args: Vec<Value>,
        location: &'static Location<'static>,
    ) -> ThreadedResult<Value> {
        let manager = &self.inner.manager;
        let instance = &self.inner.instance;
        let args = manager.encode_args(instance, args)?;
        let reply = manager
            .request(instance, InstanceCommand::Function { fcn: name, args })
            .await?;
        manager
            .value_from_reply(instance, reply)
            .map_err(|e| with_call_site(e, location))
    }

    /// This proxy as a value, e.g. to pass it back to its own instance
    pub fn to_value(&self) -> Value {
        Value::Instance(self.inner.instance.this.clone())
    }

    /// The proxy a value refers to, if it refers to one
    pub fn from_value(value: &Value) -> Option<Self> {
        let token = value.as_instance()?.downcast::<ProxyToken>()?;
        let inner = token.proxy.get()?.upgrade()?;
        Some(Self { inner })
    }

    pub fn ptr_eq(&self, other: &ThreadedProxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ThreadedProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedProxy")
            .field("instance_id", &self.inner.instance.id)
            .field("class", &self.inner.instance.export_name)
            .finish()
    }
}

fn with_call_site(err: ThreadedError, location: &'static Location<'static>) -> ThreadedError {
    match err {
        ThreadedError::Invocation(e) => ThreadedError::Invocation(e.with_frame(format!(
            "{}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        ))),
        other => other,
    }
}
