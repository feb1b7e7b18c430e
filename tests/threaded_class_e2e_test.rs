//! End-to-end tests of proxied instances, mostly on worker threads

use anyhow::Result;
use std::time::{Duration, Instant};

use threadbound_config::{RuntimeConfig, ThreadMode, ThreadedClassConfig};
use threadbound_execution::{EventKind, ThreadedError, ThreadedProxy, ThreadedRuntime};
use threadbound_fixtures::{fixture_registry, house_args, HOUSE_MODULE};
use threadbound_ipc::{Callback, Value};

fn runtime() -> ThreadedRuntime {
    runtime_in(ThreadMode::WorkerThreads)
}

fn runtime_in(mode: ThreadMode) -> ThreadedRuntime {
    let _ = threadbound_logging::init_simple_tracing("warn");
    let mut config = RuntimeConfig::default()
        .with_thread_mode(mode)
        .with_handle_exit_signals(false);
    if mode == ThreadMode::ChildProcess {
        config = config.with_worker_path(env!("CARGO_BIN_EXE_fixture-worker"));
    }
    ThreadedRuntime::new(config, fixture_registry()).expect("runtime")
}

async fn house(runtime: &ThreadedRuntime) -> Result<ThreadedProxy> {
    Ok(runtime
        .threaded_class(HOUSE_MODULE, "House", house_args(), None)
        .await?)
}

fn strings(value: &Value) -> Vec<String> {
    value
        .as_array()
        .unwrap_or_default()
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_methods_and_properties() -> Result<()> {
    let runtime = runtime();
    let house = house(&runtime).await?;

    assert_eq!(strings(&house.call("getWindows", vec![]).await?), vec!["west", "east"]);
    assert_eq!(strings(&house.call("getRooms", vec![]).await?), vec!["south"]);
    assert_eq!(house.get("windowCount").await?.as_f64(), Some(2.0));

    assert_eq!(house.get("name").await?.as_str(), Some("house"));
    house.set("name", Value::from("villa"))?;
    // Sends are ordered, so the read observes the write
    assert_eq!(house.get("name").await?.as_str(), Some("villa"));

    assert!(matches!(
        house.set("windowCount", Value::from(3)),
        Err(ThreadedError::InvalidArgument(_))
    ));
    assert!(matches!(
        house.call("demolish", vec![]).await,
        Err(ThreadedError::UnknownMember { .. })
    ));

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_set_emits_warning() -> Result<()> {
    let runtime = runtime();
    let house = house(&runtime).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = runtime.on_event(&house, EventKind::Warning, move |event| {
        let _ = tx.send(event.message.clone().unwrap_or_default());
    });

    house.set("name", Value::from(42))?;
    let warning = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .unwrap_or_default();
    assert!(warning.contains("name must be a string"), "warning: {}", warning);
    assert_eq!(house.get("name").await?.as_str(), Some("house"));

    subscription.stop();
    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remote_errors_keep_both_stacks() -> Result<()> {
    let runtime = runtime();
    let house = house(&runtime).await?;

    match house.call("throwError", vec![]).await {
        Err(ThreadedError::Invocation(err)) => {
            assert_eq!(err.message(), "the roof leaks");
            let frames = err.frames();
            assert!(frames.iter().any(|frame| frame.contains("executing function \"throwError\"")));
            assert!(frames
                .iter()
                .any(|frame| frame.contains("threaded_class_e2e_test.rs")));
        }
        other => panic!("expected an invocation error, got {:?}", other),
    }

    // The instance keeps working
    assert_eq!(strings(&house.call("getRooms", vec![]).await?), vec!["south"]);
    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_constructor_failure_leaves_nothing_behind() -> Result<()> {
    let runtime = runtime();
    let err = runtime
        .threaded_class(HOUSE_MODULE, "House", vec![Value::Null], None)
        .await
        .unwrap_err();
    match err {
        ThreadedError::Construction(e) => assert!(e.message().contains("needs windows")),
        other => panic!("expected a construction error, got {:?}", other),
    }
    assert_eq!(runtime.thread_count(), 0);

    let err = runtime
        .threaded_class("fixtures/garden", "House", vec![], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ThreadedError::Resolution(_)));
    assert_eq!(runtime.thread_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_callbacks_cross_both_ways() -> Result<()> {
    let runtime = runtime();
    let house = house(&runtime).await?;

    let shout = Callback::from_fn(|args| {
        let word = args.first().and_then(Value::as_str).unwrap_or_default();
        Ok(Value::from(word.to_uppercase()))
    });
    let result = house
        .call("callCallback", vec![Value::from("hello"), Value::from(shout)])
        .await?;
    assert_eq!(result.as_str(), Some("HELLO"));

    // A failing parent callback surfaces in the worker and back here
    let failing = Callback::from_fn(|_| Err(threadbound_ipc::CallError::new("no thanks")));
    let err = house
        .call("callCallback", vec![Value::from(1), Value::from(failing)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no thanks"), "error: {}", err);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_returning_self_yields_the_proxy() -> Result<()> {
    let runtime = runtime();
    let house = house(&runtime).await?;

    let value = house.call("returnSelf", vec![]).await?;
    let same = ThreadedProxy::from_value(&value).expect("a proxy");
    assert!(same.ptr_eq(&house));

    // Passing the proxy back in is allowed for its own instance only
    let echoed = house
        .call("slowEcho", vec![Value::from(0), house.to_value()])
        .await?;
    assert!(ThreadedProxy::from_value(&echoed).is_some_and(|proxy| proxy.ptr_eq(&house)));

    let other = runtime
        .threaded_class(HOUSE_MODULE, "House", house_args(), None)
        .await?;
    let err = house
        .call("slowEcho", vec![Value::from(0), other.to_value()])
        .await
        .unwrap_err();
    assert!(matches!(err, ThreadedError::UnsupportedAttribute(_)));

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_functions_nested_in_arrays_are_rejected() -> Result<()> {
    let runtime = runtime();
    let house = house(&runtime).await?;

    let nested = Value::from(vec![Value::from(Callback::from_fn(|_| Ok(Value::Null)))]);
    let err = house
        .call("slowEcho", vec![Value::from(0), nested])
        .await
        .unwrap_err();
    assert!(matches!(err, ThreadedError::UnsupportedAttribute(_)), "error: {:?}", err);

    runtime.shutdown().await;
    Ok(())
}

/// A quick call issued while a slow one is in flight must not wait for it
async fn assert_calls_overlap(mode: ThreadMode) -> Result<()> {
    let runtime = runtime_in(mode);
    let house = house(&runtime).await?;

    let started = Instant::now();
    let slow = tokio::spawn(house.call("slowEcho", vec![Value::from(400), Value::from("slow")]));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = house
        .call("slowEcho", vec![Value::from(0), Value::from("fast")])
        .await?;
    assert_eq!(fast.as_str(), Some("fast"));
    assert!(!slow.is_finished(), "{:?}: the slow call finished first", mode);

    assert_eq!(slow.await??.as_str(), Some("slow"));
    assert!(started.elapsed() >= Duration::from_millis(400));

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() -> Result<()> {
    assert_calls_overlap(ThreadMode::WorkerThreads).await
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently_in_process() -> Result<()> {
    assert_calls_overlap(ThreadMode::InProcess).await
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently_in_child_process() -> Result<()> {
    assert_calls_overlap(ThreadMode::ChildProcess).await
}
