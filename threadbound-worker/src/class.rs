//! Class descriptors and the registry of classes a worker can construct

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use threadbound_ipc::{CallError, InstanceRef, PropertyDescriptor, PropertyKind, Value};

use crate::dispatcher::CallContext;

/// Statically declared shape of a proxied class.
///
/// Members are listed in declaration order; the first declaration of a key
/// wins, so members of the class itself shadow those pulled in by
/// [`ClassDescriptor::extends`].
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    name: String,
    members: Vec<PropertyDescriptor>,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(self, key: impl Into<String>) -> Self {
        self.member(key, PropertyKind::Function, false, false, false, true, true)
    }

    /// Plain data property
    pub fn field(self, key: impl Into<String>) -> Self {
        self.member(key, PropertyKind::Value, true, false, false, true, true)
    }

    pub fn readonly_field(self, key: impl Into<String>) -> Self {
        self.member(key, PropertyKind::Value, true, false, false, false, true)
    }

    pub fn getter(self, key: impl Into<String>) -> Self {
        self.member(key, PropertyKind::Value, false, true, false, false, false)
    }

    pub fn setter(self, key: impl Into<String>) -> Self {
        self.member(key, PropertyKind::Value, false, false, true, false, false)
    }

    /// Property with both a getter and a setter
    pub fn accessor(self, key: impl Into<String>) -> Self {
        self.member(key, PropertyKind::Value, false, true, true, false, false)
    }

    /// Inherit the members of `base` that this class does not declare itself
    pub fn extends(mut self, base: &ClassDescriptor) -> Self {
        for descriptor in &base.members {
            self.push(descriptor.clone());
        }
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn member(
        mut self,
        key: impl Into<String>,
        kind: PropertyKind,
        enumerable: bool,
        get: bool,
        set: bool,
        writable: bool,
        readable: bool,
    ) -> Self {
        self.push(PropertyDescriptor {
            key: key.into(),
            kind,
            enumerable,
            get,
            set,
            writable,
            readable,
        });
        self
    }

    fn push(&mut self, descriptor: PropertyDescriptor) {
        if self.lookup(&descriptor.key).is_none() {
            self.members.push(descriptor);
        }
    }

    pub fn lookup(&self, key: &str) -> Option<&PropertyDescriptor> {
        self.members.iter().find(|member| member.key == key)
    }

    /// The property manifest sent back in reply to INIT
    pub fn manifest(&self) -> Vec<PropertyDescriptor> {
        self.members.clone()
    }
}

/// An object living inside a worker, driven by incoming messages.
///
/// Implementations use interior mutability; calls for the same instance may
/// interleave at await points.
#[async_trait]
pub trait ThreadedObject: Send + Sync + 'static {
    /// Invoke a method
    async fn call(&self, ctx: &CallContext, method: &str, args: Vec<Value>)
        -> Result<Value, CallError>;

    /// Read a property
    fn get(&self, _ctx: &CallContext, property: &str) -> Result<Value, CallError> {
        Err(CallError::new(format!("Property \"{}\" is not readable", property)))
    }

    /// Assign a property
    fn set(&self, _ctx: &CallContext, property: &str, _value: Value) -> Result<(), CallError> {
        Err(CallError::new(format!("Property \"{}\" is not writable", property)))
    }
}

/// Builds an instance from its decoded constructor arguments
pub type Constructor =
    Arc<dyn Fn(&CallContext, Vec<Value>) -> Result<Arc<dyn ThreadedObject>, CallError> + Send + Sync>;

/// The slot an instance reference points at; filled once construction ends
#[derive(Default)]
pub struct InstanceCell {
    object: OnceLock<Arc<dyn ThreadedObject>>,
}

impl InstanceCell {
    pub fn get(&self) -> Option<&Arc<dyn ThreadedObject>> {
        self.object.get()
    }

    pub(crate) fn fill(&self, object: Arc<dyn ThreadedObject>) -> bool {
        self.object.set(object).is_ok()
    }
}

/// The object behind an instance reference, if it was built by a worker
pub fn object_of(instance: &InstanceRef) -> Option<Arc<dyn ThreadedObject>> {
    instance.downcast::<InstanceCell>()?.get().cloned()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Module \"{0}\" is not registered")]
    ModuleNotFound(String),

    #[error("Module \"{module}\" has no export \"{export}\"")]
    ExportNotFound { module: String, export: String },
}

/// A class that can be constructed inside a worker
#[derive(Clone)]
pub struct RegisteredClass {
    pub descriptor: Arc<ClassDescriptor>,
    pub constructor: Constructor,
}

/// Module path and export name to class table, shared by the parent (to
/// reject unknown classes before spawning) and every worker
#[derive(Clone, Default)]
pub struct ClassRegistry {
    modules: HashMap<String, HashMap<String, RegisteredClass>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `descriptor` as an export of `module_path`, under its name
    pub fn register<F>(
        &mut self,
        module_path: impl Into<String>,
        descriptor: ClassDescriptor,
        constructor: F,
    ) -> &mut Self
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<Arc<dyn ThreadedObject>, CallError>
            + Send
            + Sync
            + 'static,
    {
        let export = descriptor.name().to_string();
        self.modules.entry(module_path.into()).or_default().insert(
            export,
            RegisteredClass {
                descriptor: Arc::new(descriptor),
                constructor: Arc::new(constructor),
            },
        );
        self
    }

    pub fn with_class<F>(
        mut self,
        module_path: impl Into<String>,
        descriptor: ClassDescriptor,
        constructor: F,
    ) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<Arc<dyn ThreadedObject>, CallError>
            + Send
            + Sync
            + 'static,
    {
        self.register(module_path, descriptor, constructor);
        self
    }

    pub fn resolve(&self, module_path: &str, export: &str) -> Result<&RegisteredClass, ResolveError> {
        let exports = self
            .modules
            .get(module_path)
            .ok_or_else(|| ResolveError::ModuleNotFound(module_path.to_string()))?;
        exports.get(export).ok_or_else(|| ResolveError::ExportNotFound {
            module: module_path.to_string(),
            export: export.to_string(),
        })
    }

    pub fn has_module(&self, module_path: &str) -> bool {
        self.modules.contains_key(module_path)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}
