use anyhow::Result;
use dyncfg::cfg::{
    CancelToken, Canceller, ConfigChange, Manager, ManagerConfig, ManagerOptions, Snapshot,
    Source, WatchStream,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::common::{init_tracing, memory, wait_until, wait_watching};

#[test]
fn test_override_order_across_sources() -> Result<()> {
    let (a, _) = memory("a", &[("K", "a"), ("ONLY_A", "1")]);
    let (b, _) = memory("b", &[("K", "b")]);
    let (c, _) = memory("c", &[("K", "c"), ("ONLY_C", "3")]);

    let manager = Manager::new(vec![a, b, c], Duration::from_millis(50))?;

    assert_eq!(
        manager.snapshot(),
        Snapshot::from_iter([("K", "c"), ("ONLY_A", "1"), ("ONLY_C", "3")])
    );
    Ok(())
}

#[test]
fn test_update_from_lower_source_keeps_higher_override() -> Result<()> {
    let (defaults, defaults_handle) = memory("defaults", &[("HTTP_PORT", "8080")]);
    let (env, env_handle) = memory("env", &[]);
    let manager = Manager::new(vec![defaults, env], Duration::from_millis(20))?;
    wait_watching(&env_handle);
    wait_watching(&defaults_handle);

    env_handle.set(Snapshot::from_iter([("HTTP_PORT", "9090")]));
    assert!(wait_until(Duration::from_secs(2), || {
        manager.value("HTTP_PORT").as_deref() == Some("9090")
    }));

    // 低优先级源的变化被高优先级源遮盖，合并结果不变，不发布
    let published = manager.publish_count();
    defaults_handle.set(Snapshot::from_iter([("HTTP_PORT", "7070")]));
    thread::sleep(Duration::from_millis(200));

    assert_eq!(manager.value("HTTP_PORT").as_deref(), Some("9090"));
    assert_eq!(manager.publish_count(), published);
    Ok(())
}

#[test]
fn test_readers_never_observe_torn_snapshot() -> Result<()> {
    let (source, handle) = memory("m", &[("A", "0"), ("B", "0")]);
    let manager = Arc::new(Manager::new(vec![source], Duration::ZERO)?);
    wait_watching(&handle);

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut last = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    let snapshot = manager.snapshot();
                    let a: u64 = snapshot.get("A").unwrap().parse().unwrap();
                    let b: u64 = snapshot.get("B").unwrap().parse().unwrap();
                    assert_eq!(a, b, "torn snapshot");
                    assert!(a >= last, "snapshot went backwards");
                    last = a;
                }
            })
        })
        .collect();

    for i in 1..=200u64 {
        let v = i.to_string();
        handle.set(Snapshot::from_iter([("A", v.as_str()), ("B", v.as_str())]));
        if i % 20 == 0 {
            thread::sleep(Duration::from_millis(2));
        }
    }

    assert!(wait_until(Duration::from_secs(3), || {
        manager.value("A").as_deref() == Some("200")
    }));
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().unwrap();
    }
    Ok(())
}

#[test]
fn test_callbacks_see_published_snapshot_in_order() -> Result<()> {
    let (source, handle) = memory("m", &[("V", "0")]);
    let manager = Manager::new(vec![source], Duration::from_millis(10))?;
    wait_watching(&handle);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = manager.on_update(move |snapshot| {
        s.lock().unwrap().push(snapshot.get("V").unwrap().to_string());
        Ok(())
    });

    for v in ["1", "2", "3"] {
        handle.set(Snapshot::from_iter([("V", v)]));
        assert!(wait_until(Duration::from_secs(2), || {
            manager.value("V").as_deref() == Some(v)
        }));
    }

    assert!(wait_until(Duration::from_secs(1), || seen.lock().unwrap().len() == 3));
    assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);
    Ok(())
}

#[test]
fn test_close_stops_watchers_and_callbacks() -> Result<()> {
    let (a, a_handle) = memory("a", &[("K", "1")]);
    let (b, b_handle) = memory("b", &[]);
    let manager = Manager::new(vec![a, b], Duration::from_millis(100))?;
    wait_watching(&a_handle);
    wait_watching(&b_handle);
    assert_eq!(manager.running_watchers(), 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let _sub = manager.on_update(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    // 防抖窗口内关闭，挂起的发布被丢弃
    a_handle.set(Snapshot::from_iter([("K", "2")]));
    manager.close();

    assert!(manager.is_closed());
    assert_eq!(manager.running_watchers(), 0);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.value("K").as_deref(), Some("1"));

    manager.close();
    Ok(())
}

#[test]
fn test_external_cancel_token_shuts_down() -> Result<()> {
    let (source, handle) = memory("m", &[("K", "1")]);
    let canceller = Canceller::new();
    let manager = Manager::with_options(
        vec![source],
        ManagerConfig::default().with_debounce(Duration::from_millis(10)),
        ManagerOptions::new().with_cancel_token(canceller.token()),
    )?;
    wait_watching(&handle);

    canceller.cancel();

    assert!(wait_until(Duration::from_secs(2), || manager.running_watchers() == 0));
    assert!(manager.is_closed());
    Ok(())
}

#[test]
fn test_source_error_degrades_without_affecting_others() -> Result<()> {
    init_tracing();
    let (flaky, flaky_handle) = memory("flaky", &[("A", "1")]);
    let (stable, stable_handle) = memory("stable", &[("B", "1")]);
    let manager = Manager::new(vec![flaky, stable], Duration::from_millis(10))?;
    wait_watching(&flaky_handle);
    wait_watching(&stable_handle);

    flaky_handle.fail("connection reset");
    assert!(wait_until(Duration::from_secs(2), || {
        manager.degraded_sources() == vec!["flaky".to_string()]
    }));

    stable_handle.set(Snapshot::from_iter([("B", "2")]));
    assert!(wait_until(Duration::from_secs(2), || {
        manager.value("B").as_deref() == Some("2")
    }));
    // 降级源的最后快照仍参与合并
    assert_eq!(manager.value("A").as_deref(), Some("1"));
    assert!(wait_until(Duration::from_secs(2), || manager.running_watchers() == 1));
    Ok(())
}

/// watch 直接返回错误的配置源
struct NoWatchSource;

impl Source for NoWatchSource {
    fn name(&self) -> String {
        "no-watch".to_string()
    }

    fn load(&self) -> Result<Snapshot> {
        Ok(Snapshot::from_iter([("STATIC", "yes")]))
    }

    fn watch(&self, _cancel: CancelToken) -> Result<WatchStream> {
        Err(anyhow::anyhow!("watch not supported"))
    }
}

#[test]
fn test_watch_failure_marks_degraded() -> Result<()> {
    init_tracing();
    let sources = vec![Box::new(NoWatchSource) as Box<dyn Source>];
    let manager = Manager::new(sources, Duration::from_millis(10))?;

    assert!(wait_until(Duration::from_secs(2), || {
        !manager.degraded_sources().is_empty()
    }));
    assert_eq!(manager.degraded_sources(), vec!["no-watch".to_string()]);
    assert_eq!(manager.value("STATIC").as_deref(), Some("yes"));
    assert!(wait_until(Duration::from_secs(2), || manager.running_watchers() == 0));
    Ok(())
}

/// 一次推送多个变更的配置源
struct BurstSource {
    values: Vec<&'static str>,
}

impl Source for BurstSource {
    fn name(&self) -> String {
        "burst".to_string()
    }

    fn load(&self) -> Result<Snapshot> {
        Ok(Snapshot::from_iter([("V", "0")]))
    }

    fn watch(&self, cancel: CancelToken) -> Result<WatchStream> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let values = self.values.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for v in values {
                let _ = tx.send(ConfigChange::Updated(Snapshot::from_iter([("V", v)])));
            }
            cancel.wait();
        });
        Ok(rx)
    }
}

#[test]
fn test_burst_publishes_once_with_last_value() -> Result<()> {
    let source = BurstSource {
        values: vec!["1", "2", "3", "4", "5"],
    };
    let manager = Manager::new(
        vec![Box::new(source) as Box<dyn Source>],
        Duration::from_millis(150),
    )?;

    assert!(wait_until(Duration::from_secs(2), || manager.publish_count() == 1));
    thread::sleep(Duration::from_millis(300));

    assert_eq!(manager.publish_count(), 1);
    assert_eq!(manager.value("V").as_deref(), Some("5"));
    Ok(())
}

#[test]
fn test_from_config_with_registry_sources() -> Result<()> {
    let config: ManagerConfig = serde_yaml::from_str(
        r#"
debounce: 50ms
shutdown_grace: 1s
sources:
  - type: MemorySource
    options:
      name: defaults
      values:
        HTTP_PORT: "8080"
        LOG_LEVEL: info
  - type: MemorySource
    options:
      name: overrides
      values:
        LOG_LEVEL: debug
"#,
    )?;

    let manager = Manager::from_config(config, ManagerOptions::new())?;

    assert_eq!(manager.source_names(), ["defaults", "overrides"]);
    assert_eq!(
        manager.snapshot(),
        Snapshot::from_iter([("HTTP_PORT", "8080"), ("LOG_LEVEL", "debug")])
    );
    Ok(())
}

#[test]
fn test_from_config_unknown_source_type() {
    let config: ManagerConfig =
        serde_json::from_str(r#"{"sources": [{"type": "EtcdSource"}]}"#).unwrap();

    let err = Manager::from_config(config, ManagerOptions::new()).err().unwrap();
    assert!(err.to_string().contains("EtcdSource"));
}
