//! Creating proxied instances

use std::path::{Component, Path};
use std::panic::Location;
use std::sync::Arc;
use tracing::{debug, info};

use threadbound_config::{ThreadedClassConfig, Validatable};
use threadbound_ipc::Value;
use threadbound_worker::{ClassRegistry, ResolveError};

use crate::error::{ThreadedError, ThreadedResult};
use crate::events::EventKind;
use crate::manager::Manager;
use crate::monitor::start_monitoring;
use crate::proxy::ThreadedProxy;

/// Place, construct and wrap a new instance of `export_name` from
/// `module_path`.
///
/// Relative module paths (`./`, `../`) are resolved against the directory of
/// the calling source file first, then tried verbatim.
pub(crate) async fn build_proxy(
    manager: Arc<Manager>,
    caller: &'static Location<'static>,
    module_path: String,
    export_name: String,
    args: Vec<Value>,
    config: ThreadedClassConfig,
) -> ThreadedResult<ThreadedProxy> {
    if module_path.trim().is_empty() {
        return Err(ThreadedError::InvalidArgument(
            "module path must not be empty".to_string(),
        ));
    }
    if export_name.trim().is_empty() {
        return Err(ThreadedError::InvalidArgument(
            "export name must not be empty".to_string(),
        ));
    }
    config.validate()?;

    // Unknown classes fail here, before any worker is started
    let module_path =
        resolve_module_path(&manager.registry, &module_path, &export_name, caller.file())?;

    let child = manager.find_next_available_child(&config)?;
    if child.has_crashed() {
        // A pinned child that crashed without auto restart is brought back on demand
        info!("Relaunching crashed child {} for a new instance", child.id);
        if manager.restart_child(&child, false).await? {
            let revived: Vec<_> = child.state.lock().instances.values().cloned().collect();
            for instance in &revived {
                manager.emit(EventKind::Restarted, instance, &child.id, "relaunched for a new instance");
            }
        }
    }
    let instance =
        manager.attach_instance(&child, module_path, export_name, args, config);
    debug!("Initializing {} on child {}", instance.id, child.id);

    let manifest = match manager.send_init(&instance).await {
        Ok(manifest) => manifest,
        Err(e) => {
            // Leaves no instance behind, and no child if it hosted nothing else
            manager.destroy(&instance).await;
            return Err(e);
        }
    };

    let proxy = ThreadedProxy::new(manager.clone(), instance.clone(), manifest);
    start_monitoring(&manager, &instance);
    info!(
        "Created {} ({}) on child {}",
        instance.export_name, instance.id, child.id
    );
    Ok(proxy)
}

fn resolve_module_path(
    registry: &ClassRegistry,
    module_path: &str,
    export_name: &str,
    caller_file: &str,
) -> ThreadedResult<String> {
    let mut candidates = Vec::with_capacity(2);
    if module_path.starts_with("./") || module_path.starts_with("../") {
        let base = Path::new(caller_file).parent().unwrap_or_else(|| Path::new(""));
        candidates.push(normalize(&base.join(module_path)));
    }
    candidates.push(module_path.to_string());

    let mut missing_export = None;
    for candidate in candidates {
        match registry.resolve(&candidate, export_name) {
            Ok(_) => return Ok(candidate),
            Err(e @ ResolveError::ExportNotFound { .. }) => missing_export = Some(e),
            Err(ResolveError::ModuleNotFound(_)) => {}
        }
    }
    let err = missing_export.unwrap_or_else(|| ResolveError::ModuleNotFound(module_path.to_string()));
    Err(ThreadedError::Resolution(err.to_string()))
}

/// Lexically resolve `.` and `..`, joining with `/`
fn normalize(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;
    for component in path.components() {
        match component {
            Component::RootDir => absolute = true,
            Component::Prefix(prefix) => parts.push(prefix.as_os_str().to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                _ => parts.push("..".to_string()),
            },
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use threadbound_ipc::CallError;
    use threadbound_worker::{CallContext, ClassDescriptor, ThreadedObject};

    struct Nothing;

    #[async_trait]
    impl ThreadedObject for Nothing {
        async fn call(&self, _: &CallContext, _: &str, _: Vec<Value>) -> Result<Value, CallError> {
            Ok(Value::Undefined)
        }
    }

    fn registry() -> ClassRegistry {
        ClassRegistry::new().with_class(
            "src/fixtures/house",
            ClassDescriptor::new("House").method("getRooms"),
            |_, _| Ok(Arc::new(Nothing) as Arc<dyn ThreadedObject>),
        )
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("src/./fixtures/house")), "src/fixtures/house");
        assert_eq!(normalize(Path::new("src/a/../fixtures")), "src/fixtures");
        assert_eq!(normalize(Path::new("../x")), "../x");
        assert_eq!(normalize(Path::new("/a/b/../c")), "/a/c");
    }

    #[test]
    fn test_relative_path_resolves_against_caller() {
        let registry = registry();
        assert_eq!(
            resolve_module_path(&registry, "./fixtures/house", "House", "src/lib.rs").unwrap(),
            "src/fixtures/house"
        );
        assert_eq!(
            resolve_module_path(&registry, "../fixtures/house", "House", "src/nested/mod.rs")
                .unwrap(),
            "src/fixtures/house"
        );
        assert_eq!(
            resolve_module_path(&registry, "src/fixtures/house", "House", "tests/e2e.rs").unwrap(),
            "src/fixtures/house"
        );
    }

    #[test]
    fn test_resolution_errors() {
        let registry = registry();
        let err = resolve_module_path(&registry, "./garden", "House", "src/lib.rs").unwrap_err();
        assert!(matches!(err, ThreadedError::Resolution(_)));
        assert!(err.to_string().contains("./garden"));

        let err =
            resolve_module_path(&registry, "./fixtures/house", "Garage", "src/lib.rs").unwrap_err();
        assert!(err.to_string().contains("has no export \"Garage\""));
    }
}
