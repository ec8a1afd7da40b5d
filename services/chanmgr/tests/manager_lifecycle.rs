//! Channel open/close, on-demand I/O and teardown through the manager

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chanmgr::drivers::SimulatedDriver;
use chanmgr::types::{AppId, Direction, Quality, Sampling, Value, ValueContainer};
use chanmgr::{ChannelManagerError, ErrorKind};
use common::{device, locator, setup};

#[tokio::test]
async fn test_open_is_idempotent_per_key() {
    let (manager, sim) = setup();
    let app = AppId::new("hmi");
    let loc = locator("p1", "temp");

    let first = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    let second = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // a different app gets its own handle on the same channel
    let other = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &AppId::new("logger"))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &other));

    let driver = manager.driver("sim").unwrap();
    assert_eq!(driver.channel_count(), 1);
    assert_eq!(driver.channel(&loc).unwrap().configuration_count().await, 2);
    assert_eq!(sim.added_channels(), vec![loc]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opens_share_one_channel() {
    let (manager, sim) = setup();
    let manager = Arc::new(manager);
    let loc = locator("p1", "temp");

    let mut tasks = Vec::new();
    for i in 0..16 {
        let manager = Arc::clone(&manager);
        let loc = loc.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .add_channel(
                    &loc,
                    Direction::Input,
                    Sampling::OnDemand,
                    &AppId::new(format!("app{}", i % 4)),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let driver = manager.driver("sim").unwrap();
    assert_eq!(driver.channel_count(), 1);
    assert_eq!(driver.channel(&loc).unwrap().configuration_count().await, 4);
    assert_eq!(sim.added_channels().len(), 1);
}

#[tokio::test]
async fn test_last_delete_closes_channel() {
    let (manager, sim) = setup();
    let loc = locator("p1", "temp");
    let a = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &AppId::new("a"))
        .await
        .unwrap();
    let b = manager
        .add_channel(&loc, Direction::InOut, Sampling::OnDemand, &AppId::new("b"))
        .await
        .unwrap();

    assert!(manager.delete_channel(&a).await);
    assert!(a.is_removed());
    assert!(!b.is_removed());
    assert!(sim.removed_channels().is_empty());

    assert!(manager.delete_channel(&b).await);
    assert!(!manager.delete_channel(&b).await);
    assert_eq!(manager.driver("sim").unwrap().channel_count(), 0);
    assert_eq!(sim.removed_channels(), vec![loc]);

    let err = manager.get_channel_value(&b).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_stale_handle_does_not_delete_reopened_key() {
    let (manager, _sim) = setup();
    let loc = locator("p1", "temp");
    let app = AppId::new("hmi");
    let first = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    assert!(manager.delete_channel(&first).await);

    let second = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.key(), second.key());

    assert!(!manager.delete_channel(&first).await);
    assert!(!second.is_removed());
    assert!(manager.get_channel_value(&second).await.is_ok());
    assert_eq!(manager.driver("sim").unwrap().channel_count(), 1);

    assert!(manager.delete_channel(&second).await);
    assert!(!manager.delete_channel(&second).await);
}

#[tokio::test]
async fn test_on_demand_read_and_write() {
    let (manager, sim) = setup();
    let loc = locator("p1", "setpoint");
    sim.set_value(&loc, 20.5);

    let handle = manager
        .add_channel(&loc, Direction::InOut, Sampling::OnDemand, &AppId::new("hmi"))
        .await
        .unwrap();
    let sample = manager.get_channel_value(&handle).await.unwrap();
    assert_eq!(sample.value, Some(Value::Float(20.5)));
    assert_eq!(sample.quality, Quality::Good);

    manager
        .set_channel_value(&handle, Value::Float(22.0))
        .await
        .unwrap();
    assert_eq!(sim.value(&loc), Some(Value::Float(22.0)));
    assert_eq!(sim.stats.read_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.stats.write_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_direction_is_enforced() {
    let (manager, _sim) = setup();
    let app = AppId::new("hmi");
    let input = manager
        .add_channel(&locator("p1", "in"), Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    let output = manager
        .add_channel(&locator("p1", "out"), Direction::Output, Sampling::OnDemand, &app)
        .await
        .unwrap();

    let err = manager
        .set_channel_value(&input, Value::Boolean(true))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelManagerError::Security(_)));

    let err = manager.get_channel_value(&output).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);
}

#[tokio::test]
async fn test_unknown_driver_is_not_found() {
    let (manager, _sim) = setup();
    let loc = chanmgr::types::DeviceLocator::new("modbus", "tcp0", "10").channel("40001");
    let err = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &AppId::new("hmi"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(manager.driver("modbus").is_err());
}

#[tokio::test]
async fn test_duplicate_driver_is_rejected() {
    let (manager, _sim) = setup();
    let err = manager
        .add_driver(Arc::new(SimulatedDriver::new("sim")))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(manager.driver_ids(), vec!["sim".to_string()]);
}

#[tokio::test]
async fn test_oversized_period_is_rejected() {
    let (manager, sim) = setup();
    let err = manager
        .add_channel(
            &locator("p1", "temp"),
            Direction::Input,
            Sampling::Period(u64::MAX),
            &AppId::new("hmi"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(manager.driver("sim").unwrap().channel_count(), 0);
    assert!(sim.added_channels().is_empty());
    assert_eq!(manager.active_reader_threads(), 0);
}

#[test]
fn test_driver_registry_works_without_runtime() {
    let (manager, _sim) = setup();
    assert_eq!(manager.driver_ids(), vec!["sim".to_string()]);
    manager
        .add_driver(Arc::new(SimulatedDriver::new("modbus")))
        .unwrap();
    assert_eq!(manager.driver("modbus").unwrap().channel_count(), 0);
}

#[tokio::test]
async fn test_unconfigured_read_cleans_up() {
    let (manager, sim) = setup();
    let a = locator("p1", "a");
    let b = locator("p1", "b");
    sim.set_value(&a, 1);

    let results = manager
        .read_unconfigured_channels(&[a.clone(), b.clone()])
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0].sampled_value.as_ref().and_then(|s| s.value.clone()),
        Some(Value::Integer(1))
    );
    assert!(!results[1].sampled_value.as_ref().unwrap().is_good());

    // one batched read, nothing left open
    assert_eq!(sim.read_batches(), vec![vec![a, b]]);
    assert_eq!(manager.driver("sim").unwrap().channel_count(), 0);
    assert_eq!(sim.removed_channels().len(), 2);
}

#[tokio::test]
async fn test_unconfigured_write_keeps_existing_handles() {
    let (manager, sim) = setup();
    let loc = locator("p1", "sp");
    let handle = manager
        .add_channel(&loc, Direction::InOut, Sampling::OnDemand, &AppId::new("hmi"))
        .await
        .unwrap();

    manager
        .write_unconfigured_channels(&[ValueContainer::new(loc.clone(), Value::Integer(7))])
        .await
        .unwrap();
    assert_eq!(sim.value(&loc), Some(Value::Integer(7)));
    assert!(!handle.is_removed());
    assert_eq!(
        manager
            .driver("sim")
            .unwrap()
            .channel(&loc)
            .unwrap()
            .configuration_count()
            .await,
        1
    );
}

#[tokio::test]
async fn test_unconfigured_across_drivers_is_rejected() {
    let (manager, sim) = setup();
    let other = Arc::new(SimulatedDriver::new("sim2"));
    manager.add_driver(other.clone()).unwrap();

    let mixed = [
        locator("p1", "a"),
        chanmgr::types::DeviceLocator::new("sim2", "bus0", "p1").channel("a"),
    ];
    let err = manager.read_unconfigured_channels(&mixed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert!(sim.added_channels().is_empty());
    assert!(other.added_channels().is_empty());

    assert!(manager
        .read_unconfigured_channels(&[])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_set_multiple_groups_per_driver() {
    let (manager, sim) = setup();
    let other = Arc::new(SimulatedDriver::new("sim2"));
    manager.add_driver(other.clone()).unwrap();
    let app = AppId::new("hmi");

    let a = manager
        .add_channel(&locator("p1", "a"), Direction::Output, Sampling::OnDemand, &app)
        .await
        .unwrap();
    let b = manager
        .add_channel(&locator("p2", "b"), Direction::Output, Sampling::OnDemand, &app)
        .await
        .unwrap();
    let c_loc = chanmgr::types::DeviceLocator::new("sim2", "bus0", "p1").channel("c");
    let c = manager
        .add_channel(&c_loc, Direction::Output, Sampling::OnDemand, &app)
        .await
        .unwrap();

    let err = manager
        .set_multiple_channel_values(&[a.clone(), b.clone()], vec![Value::Integer(1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);

    manager
        .set_multiple_channel_values(
            &[a, b, c],
            vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)],
        )
        .await
        .unwrap();
    assert_eq!(sim.stats.write_calls.load(Ordering::SeqCst), 1);
    assert_eq!(other.stats.write_calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.value(&locator("p2", "b")), Some(Value::Integer(2)));
    assert_eq!(other.value(&c_loc), Some(Value::Integer(3)));
}

#[tokio::test]
async fn test_get_configuration_finds_only_open_keys() {
    let (manager, _sim) = setup();
    let app = AppId::new("hmi");
    let loc = locator("p1", "temp");
    assert!(manager
        .get_configuration(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .is_err());

    let handle = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    let found = manager
        .get_configuration(&loc, Direction::Input, Sampling::OnDemand, &app)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&handle, &found));

    let err = manager
        .get_configuration(&loc, Direction::Output, Sampling::OnDemand, &app)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_remove_app_closes_only_its_handles() {
    let (manager, sim) = setup();
    let loc = locator("p1", "temp");
    let mine = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &AppId::new("mine"))
        .await
        .unwrap();
    let theirs = manager
        .add_channel(&loc, Direction::Input, Sampling::OnDemand, &AppId::new("theirs"))
        .await
        .unwrap();
    let solo = manager
        .add_channel(&locator("p2", "x"), Direction::Input, Sampling::OnDemand, &AppId::new("mine"))
        .await
        .unwrap();

    manager.remove_app(&AppId::new("mine")).await;
    assert!(mine.is_removed());
    assert!(solo.is_removed());
    assert!(!theirs.is_removed());
    assert_eq!(manager.get_all_configured_channels().await.len(), 1);
    assert_eq!(sim.removed_channels(), vec![locator("p2", "x")]);
}

#[tokio::test]
async fn test_remove_driver_invalidates_handles() {
    let (manager, sim) = setup();
    let handle = manager
        .add_channel(&locator("p1", "temp"), Direction::Input, Sampling::Period(100), &AppId::new("hmi"))
        .await
        .unwrap();
    assert_eq!(manager.active_reader_threads(), 1);

    assert!(manager.remove_driver("sim").await);
    assert!(!manager.remove_driver("sim").await);
    assert!(handle.is_removed());
    assert_eq!(manager.active_reader_threads(), 0);
    assert_eq!(sim.removed_channels().len(), 1);

    let err = manager.get_channel_value(&handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let (manager, sim) = setup();
    let app = AppId::new("hmi");
    for addr in ["p1", "p2", "p3"] {
        manager
            .add_channel(&device(addr).channel("v"), Direction::Input, Sampling::Period(50), &app)
            .await
            .unwrap();
    }
    assert_eq!(manager.active_reader_threads(), 3);

    manager.shutdown().await;
    assert_eq!(manager.active_reader_threads(), 0);
    assert!(manager.driver_ids().is_empty());
    assert_eq!(sim.removed_channels().len(), 3);
    assert!(sim.listen_set().is_empty());
    assert!(!sim.has_sink());
}
