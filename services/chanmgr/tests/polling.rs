//! Reader loops: scheduling, batching and thread assignment

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chanmgr::config::ChannelManagerConfig;
use chanmgr::core::{KeyedReaderThreadFactory, ReaderFactoryKind, ReaderSettings, ReaderThreadFactory};
use chanmgr::drivers::SimulatedDriver;
use chanmgr::types::{AppId, Direction, Sampling, Value};
use chanmgr::{ChannelEventListener, ConfigurationKey, Driver, EventType};
use common::{device, locator, setup, setup_with, wait_until, EventRecorder, SIM};

#[tokio::test]
async fn test_period_drives_read_rate() {
    let (manager, sim) = setup();
    let loc = locator("p1", "temp");
    sim.set_value(&loc, 1.0);

    manager
        .add_channel(&loc, Direction::Input, Sampling::Period(100), &AppId::new("hmi"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(550)).await;

    let reads = sim.stats.read_calls.load(Ordering::SeqCst);
    assert!((3..=8).contains(&reads), "unexpected read count {}", reads);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_due_channels_of_a_device_share_one_batch() {
    let (manager, sim) = setup();
    // slow reads let the later channels fall due together
    sim.set_read_delay(Some(Duration::from_millis(100)));
    let app = AppId::new("hmi");
    // two configurations on the same polled locator
    for app in [&app, &AppId::new("trend")] {
        manager
            .add_channel(&locator("p1", "a"), Direction::Input, Sampling::Period(200), app)
            .await
            .unwrap();
    }
    for ch in ["b", "c"] {
        manager
            .add_channel(&locator("p1", ch), Direction::Input, Sampling::Period(200), &app)
            .await
            .unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(2), || {
            sim.read_batches().iter().any(|b| b.len() >= 2)
        })
        .await
    );
    for batch in sim.read_batches() {
        let unique: HashSet<_> = batch.iter().collect();
        assert_eq!(unique.len(), batch.len(), "duplicate locator in {:?}", batch);
    }
    assert_eq!(manager.active_reader_threads(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_mixed_periods_keep_their_own_cadence() {
    let (manager, sim) = setup();
    let app = AppId::new("hmi");
    let fast = locator("p1", "fast");
    let slow = locator("p1", "slow");
    manager
        .add_channel(&fast, Direction::Input, Sampling::Period(100), &app)
        .await
        .unwrap();
    manager
        .add_channel(&slow, Direction::Input, Sampling::Period(250), &app)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    manager.shutdown().await;

    let batches = sim.read_batches();
    let fast_reads = batches.iter().filter(|b| b.contains(&fast)).count();
    let slow_reads = batches.iter().filter(|b| b.contains(&slow)).count();
    assert!((8..=13).contains(&fast_reads), "fast read {} times", fast_reads);
    assert!((3..=6).contains(&slow_reads), "slow read {} times", slow_reads);
    // shared due times go out as one call
    assert!(batches.len() < fast_reads + slow_reads);
}

#[tokio::test]
async fn test_per_device_threads() {
    let (manager, _sim) = setup();
    let app = AppId::new("hmi");
    for addr in ["p1", "p2"] {
        for ch in ["a", "b"] {
            manager
                .add_channel(&device(addr).channel(ch), Direction::Input, Sampling::Period(500), &app)
                .await
                .unwrap();
        }
    }
    assert_eq!(manager.active_reader_threads(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_per_driver_thread_from_config() {
    let config = ChannelManagerConfig {
        reader_factory: ReaderFactoryKind::PerDriver,
        ..Default::default()
    };
    let (manager, _sim) = setup_with(&config);
    let app = AppId::new("hmi");
    for addr in ["p1", "p2", "p3"] {
        manager
            .add_channel(&device(addr).channel("v"), Direction::Input, Sampling::Period(500), &app)
            .await
            .unwrap();
    }
    assert_eq!(manager.active_reader_threads(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_reregistered_driver_gets_its_own_reader() {
    // a removed driver still closing while its replacement opens the same
    // device: both instances share the id and the factory
    let factory = KeyedReaderThreadFactory::per_device(ReaderSettings::default());
    let old_sim = Arc::new(SimulatedDriver::new(SIM));
    let new_sim = Arc::new(SimulatedDriver::new(SIM));
    let log_interval = Duration::from_millis(500);
    let old = Driver::new(old_sim.clone(), factory.clone(), log_interval);
    let new = Driver::new(new_sim.clone(), factory.clone(), log_interval);

    let key = ConfigurationKey::new(
        locator("p1", "temp"),
        Direction::Input,
        Sampling::Period(50),
        AppId::new("hmi"),
    );
    old.add_configuration(key.clone()).await.unwrap();
    new.add_configuration(key).await.unwrap();
    assert_eq!(factory.active_threads(), 1);

    old.close().await;
    assert_eq!(factory.active_threads(), 1);
    assert!(
        wait_until(Duration::from_secs(2), || {
            new_sim.stats.read_calls.load(Ordering::SeqCst) >= 3
        })
        .await
    );
    let old_reads = old_sim.stats.read_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(old_sim.stats.read_calls.load(Ordering::SeqCst), old_reads);

    new.close().await;
    assert_eq!(factory.active_threads(), 0);
}

#[tokio::test]
async fn test_reader_stops_with_last_polled_configuration() {
    let (manager, sim) = setup();
    let loc = locator("p1", "temp");
    let app = AppId::new("hmi");
    let polled = manager
        .add_channel(&loc, Direction::Input, Sampling::Period(50), &app)
        .await
        .unwrap();
    let on_demand = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    assert_eq!(manager.active_reader_threads(), 1);

    assert!(manager.delete_channel(&polled).await);
    assert_eq!(manager.active_reader_threads(), 0);
    assert!(!on_demand.is_removed());

    // loop may finish one in-flight read, then goes quiet
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = sim.stats.read_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sim.stats.read_calls.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn test_failed_read_keeps_cached_value() {
    let (manager, sim) = setup();
    let loc = locator("p1", "temp");
    sim.set_value(&loc, 42);

    let handle = manager
        .add_channel(&loc, Direction::Input, Sampling::Period(50), &AppId::new("hmi"))
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            sim.stats.read_calls.load(Ordering::SeqCst) >= 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        manager.get_channel_value(&handle).await.unwrap().value,
        Some(Value::Integer(42))
    );

    sim.set_fail_reads(true);
    let failed_from = sim.stats.read_calls.load(Ordering::SeqCst);
    assert!(
        wait_until(Duration::from_secs(2), || {
            sim.stats.read_calls.load(Ordering::SeqCst) >= failed_from + 2
        })
        .await
    );
    let sample = manager.get_channel_value(&handle).await.unwrap();
    assert_eq!(sample.value, Some(Value::Integer(42)));
    assert!(sample.is_good());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_unchanged_reads_only_reach_update_listeners() {
    let (manager, sim) = setup();
    let loc = locator("p1", "temp");
    sim.set_value(&loc, 7);
    // hold back samples until the listeners are in place
    sim.set_fail_reads(true);

    let handle = manager
        .add_channel(&loc, Direction::Input, Sampling::Period(50), &AppId::new("hmi"))
        .await
        .unwrap();
    let updates = Arc::new(EventRecorder::default());
    let changes = Arc::new(EventRecorder::default());
    let as_listener: Arc<dyn ChannelEventListener> = updates.clone();
    assert!(manager.register_update_listener(&handle, as_listener.clone()).unwrap());
    assert!(!manager.register_update_listener(&handle, as_listener).unwrap());
    manager
        .register_changed_listener(&handle, changes.clone())
        .unwrap();
    sim.set_fail_reads(false);

    assert!(wait_until(Duration::from_secs(2), || updates.count() >= 4).await);
    manager.shutdown().await;

    // first real sample replaces the placeholder, the rest repeat it
    assert_eq!(changes.count(), 1);
    assert_eq!(changes.events()[0].event_type, EventType::ValueChanged);
    assert_eq!(updates.count_of(EventType::ValueChanged), 1);
    assert!(updates.count_of(EventType::Updated) >= 3);
}

#[tokio::test]
async fn test_polled_and_listened_channels_side_by_side() {
    let (manager, sim) = setup();
    let app = AppId::new("hmi");
    let polled_loc = locator("p1", "temp");
    let listen_loc = locator("p2", "alarm");
    sim.set_value(&polled_loc, 1);

    let polled = manager
        .add_channel(&polled_loc, Direction::Input, Sampling::Period(1000), &app)
        .await
        .unwrap();
    let listened = manager
        .add_channel(&listen_loc, Direction::Input, Sampling::Listen, &app)
        .await
        .unwrap();
    let polled_events = Arc::new(EventRecorder::default());
    let listen_events = Arc::new(EventRecorder::default());
    manager
        .register_update_listener(&polled, polled_events.clone())
        .unwrap();
    manager
        .register_update_listener(&listened, listen_events.clone())
        .unwrap();

    assert!(sim.push(&listen_loc, true));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // immediate first read, then on each 1000 ms boundary
    let polled_reads = sim
        .read_batches()
        .iter()
        .filter(|b| b.contains(&polled_loc))
        .count();
    assert!((2..=3).contains(&polled_reads), "unexpected read count {}", polled_reads);
    assert!(sim.read_batches().iter().all(|b| !b.contains(&listen_loc)));
    // the first sample may land before the listener is registered
    assert!((1..=3).contains(&polled_events.count()));
    assert_eq!(listen_events.count(), 1);
    assert!(manager.get_channel_value(&polled).await.unwrap().is_good());
    assert_eq!(
        manager.get_channel_value(&listened).await.unwrap().value,
        Some(Value::Boolean(true))
    );
    manager.shutdown().await;
}
