//! Instances hosted in separate worker processes

use anyhow::Result;
use std::time::Duration;

use threadbound_config::{RuntimeConfig, ThreadMode, ThreadedClassConfig};
use threadbound_execution::{EventKind, ThreadedError, ThreadedRuntime};
use threadbound_fixtures::{fixture_registry, house_args, HOUSE_MODULE};
use threadbound_ipc::{Callback, Value};

const FIXTURE_WORKER: &str = env!("CARGO_BIN_EXE_fixture-worker");

fn runtime() -> ThreadedRuntime {
    let _ = threadbound_logging::init_simple_tracing("warn");
    let config = RuntimeConfig::default()
        .with_thread_mode(ThreadMode::ChildProcess)
        .with_worker_path(FIXTURE_WORKER)
        .with_handle_exit_signals(false);
    ThreadedRuntime::new(config, fixture_registry()).expect("runtime")
}

#[tokio::test]
async fn test_house_in_child_process() -> Result<()> {
    let runtime = runtime();
    assert_eq!(runtime.thread_mode(), ThreadMode::ChildProcess);
    let house = runtime
        .threaded_class(HOUSE_MODULE, "House", house_args(), None)
        .await?;

    let rooms = house.call("getRooms", vec![]).await?;
    assert_eq!(
        rooms.as_array().and_then(|rooms| rooms.first()).and_then(Value::as_str),
        Some("south")
    );

    let shout = Callback::from_fn(|args| {
        let word = args.first().and_then(Value::as_str).unwrap_or_default();
        Ok(Value::from(format!("{}!", word)))
    });
    let result = house
        .call("callCallback", vec![Value::from("hi"), Value::from(shout)])
        .await?;
    assert_eq!(result.as_str(), Some("hi!"));

    let usage = runtime.threads_memory_usage().await;
    let child_id = house.child_id().expect("attached");
    let stats = usage.get(&child_id).expect("memory usage of the child");
    assert_ne!(stats.pid, std::process::id());
    assert!(stats.rss > 0);

    runtime.destroy(&house).await?;
    assert_eq!(runtime.thread_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_buffers_and_errors_cross_json() -> Result<()> {
    let runtime = runtime();
    let house = runtime
        .threaded_class(HOUSE_MODULE, "House", house_args(), None)
        .await?;

    let payload = Value::from(vec![0u8, 1, 2, 254, 255]);
    let echoed = house
        .call("slowEcho", vec![Value::from(0), payload])
        .await?;
    assert_eq!(echoed.as_buffer().map(|bytes| bytes.to_vec()), Some(vec![0u8, 1, 2, 254, 255]));

    let err = house.call("throwError", vec![]).await.unwrap_err();
    assert!(matches!(err, ThreadedError::Invocation(_)));
    assert!(err.to_string().contains("the roof leaks"));

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_process_exit_restarts_child() -> Result<()> {
    let runtime = runtime();
    let config = ThreadedClassConfig::default().with_auto_restart(true);
    let house = runtime
        .threaded_class(HOUSE_MODULE, "House", house_args(), Some(config))
        .await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _restarted = runtime.on_event(&house, EventKind::Restarted, move |event| {
        let _ = tx.send(event.child_id.clone());
    });

    let err = house
        .call("exitProcess", vec![Value::from(10)])
        .await
        .unwrap_err();
    assert!(err.is_closed(), "error: {:?}", err);

    let restarted = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await?;
    assert_eq!(restarted, house.child_id());
    assert!(house.call("getRooms", vec![]).await.is_ok());

    runtime.shutdown().await;
    Ok(())
}
