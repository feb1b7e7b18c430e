//! Placement of instances onto children

use anyhow::Result;

use threadbound_config::{RuntimeConfig, ThreadMode, ThreadedClassConfig};
use threadbound_execution::{ThreadedProxy, ThreadedRuntime};
use threadbound_fixtures::{fixture_registry, house_args, HOUSE_MODULE};

fn runtime(mode: ThreadMode) -> ThreadedRuntime {
    let config = RuntimeConfig::default()
        .with_thread_mode(mode)
        .with_handle_exit_signals(false);
    ThreadedRuntime::new(config, fixture_registry()).expect("runtime")
}

async fn house(runtime: &ThreadedRuntime, config: ThreadedClassConfig) -> Result<ThreadedProxy> {
    Ok(runtime
        .threaded_class(HOUSE_MODULE, "House", house_args(), Some(config))
        .await?)
}

#[tokio::test]
async fn test_one_child_per_instance_by_default() -> Result<()> {
    let runtime = runtime(ThreadMode::WorkerThreads);
    let a = house(&runtime, ThreadedClassConfig::default()).await?;
    let b = house(&runtime, ThreadedClassConfig::default()).await?;

    assert_ne!(a.child_id(), b.child_id());
    assert_eq!(runtime.thread_count(), 2);

    runtime.destroy(&a).await?;
    assert_eq!(runtime.thread_count(), 1);
    runtime.destroy(&b).await?;
    assert_eq!(runtime.thread_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_thread_usage_packs_instances() -> Result<()> {
    let runtime = runtime(ThreadMode::WorkerThreads);
    let quarter = ThreadedClassConfig::default().with_thread_usage(0.25);

    let mut houses = Vec::new();
    for _ in 0..5 {
        houses.push(house(&runtime, quarter.clone()).await?);
    }
    let first = houses[0].child_id();
    assert!(houses[..4].iter().all(|house| house.child_id() == first));
    assert_ne!(houses[4].child_id(), first);
    assert_eq!(runtime.thread_count(), 2);

    // Freed capacity is reused
    runtime.destroy(&houses[1]).await?;
    let refill = house(&runtime, quarter).await?;
    assert_eq!(refill.child_id(), first);
    assert_eq!(runtime.thread_count(), 2);

    runtime.shutdown().await;
    assert_eq!(runtime.thread_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_named_threads_are_not_pooled() -> Result<()> {
    let runtime = runtime(ThreadMode::WorkerThreads);
    let named = house(&runtime, ThreadedClassConfig::default().with_thread_id("attic")).await?;
    let pooled = house(&runtime, ThreadedClassConfig::default().with_thread_usage(0.1)).await?;
    let joined = house(&runtime, ThreadedClassConfig::default().with_thread_id("attic")).await?;

    assert_eq!(named.child_id().as_deref(), Some("attic"));
    assert_eq!(joined.child_id().as_deref(), Some("attic"));
    assert_ne!(pooled.child_id().as_deref(), Some("attic"));
    assert_eq!(runtime.thread_count(), 2);

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_disable_multithreading_runs_in_process() -> Result<()> {
    let runtime = runtime(ThreadMode::WorkerThreads);
    let house = house(
        &runtime,
        ThreadedClassConfig::default().with_disable_multithreading(true),
    )
    .await?;
    assert_eq!(house.call("getRooms", vec![]).await?.as_array().map(<[_]>::len), Some(1));
    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() -> Result<()> {
    let runtime = runtime(ThreadMode::WorkerThreads);
    let err = runtime
        .threaded_class(
            HOUSE_MODULE,
            "House",
            house_args(),
            Some(ThreadedClassConfig::default().with_thread_usage(1.5)),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("thread_usage"), "error: {}", err);
    assert_eq!(runtime.thread_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_memory_usage_per_child() -> Result<()> {
    let runtime = runtime(ThreadMode::WorkerThreads);
    let a = house(&runtime, ThreadedClassConfig::default()).await?;
    let b = house(&runtime, ThreadedClassConfig::default()).await?;

    let usage = runtime.threads_memory_usage().await;
    assert_eq!(usage.len(), 2);
    for house in [&a, &b] {
        let child_id = house.child_id().expect("attached");
        assert!(usage.contains_key(&child_id));
    }

    runtime.shutdown().await;
    assert!(runtime.threads_memory_usage().await.is_empty());
    Ok(())
}
