use anyhow::Result;
use dyncfg::cfg::{bind, Bind, ConfigError, FieldErrorKind, Manager, Snapshot};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::{memory, wait_until, wait_watching};

#[derive(Debug, Clone, PartialEq, Bind)]
struct ServerConfig {
    #[bind(key = "HTTP_PORT", default = "8080")]
    port: u16,
    #[bind(key = "HTTP_TIMEOUT", default = "5s")]
    timeout: Duration,
    #[bind(key = "DEBUG", default = "false")]
    debug: bool,
}

#[derive(Debug, Clone, PartialEq, Bind)]
struct DatabaseConfig {
    #[bind(key = "HOST", default = "localhost")]
    host: String,
    #[bind(key = "MAX_OPEN")]
    max_open: u32,
    #[bind(key = "REPLICA")]
    replica: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Bind)]
struct AppConfig {
    #[bind(nested)]
    server: ServerConfig,
    #[bind(nested, prefix = "DB_")]
    database: DatabaseConfig,
    #[bind(skip)]
    loaded_by: String,
}

#[test]
fn test_default_applies_when_key_absent() -> Result<()> {
    let (env, _) = memory("env", &[]);
    let manager = Manager::new(vec![env], Duration::from_millis(50))?;

    let server: ServerConfig = manager.bind()?;
    assert_eq!(
        server,
        ServerConfig {
            port: 8080,
            timeout: Duration::from_secs(5),
            debug: false,
        }
    );
    Ok(())
}

#[test]
fn test_source_value_wins_over_default() -> Result<()> {
    let (env, _) = memory("env", &[("HTTP_PORT", "9090"), ("DEBUG", "TRUE")]);
    let manager = Manager::new(vec![env], Duration::from_millis(50))?;

    let server: ServerConfig = manager.bind()?;
    assert_eq!(server.port, 9090);
    assert!(server.debug);
    Ok(())
}

#[test]
fn test_nested_prefix_and_optional_fields() {
    let snapshot = Snapshot::from_iter([("DB_MAX_OPEN", "32"), ("HTTP_PORT", "81")]);

    let config: AppConfig = bind::decode(&snapshot).unwrap();

    assert_eq!(config.server.port, 81);
    assert_eq!(
        config.database,
        DatabaseConfig {
            host: "localhost".to_string(),
            max_open: 32,
            replica: None,
        }
    );
    assert_eq!(config.loaded_by, "");
}

#[test]
fn test_decode_reports_every_failing_field() {
    let snapshot = Snapshot::from_iter([("HTTP_PORT", "not-a-port"), ("HTTP_TIMEOUT", "soon")]);

    let err = bind::decode::<AppConfig>(&snapshot).unwrap_err();

    assert_eq!(
        err.paths(),
        vec!["server.port", "server.timeout", "database.max_open"]
    );
    assert!(matches!(
        &err.fields[0].kind,
        FieldErrorKind::Invalid { value, .. } if value == "not-a-port"
    ));
    assert_eq!(err.fields[2].key, "DB_MAX_OPEN");
    assert_eq!(err.fields[2].kind, FieldErrorKind::Missing);
}

#[test]
fn test_manager_bind_error_is_bind_variant() -> Result<()> {
    let (env, _) = memory("env", &[("HTTP_PORT", "70000")]);
    let manager = Manager::new(vec![env], Duration::from_millis(50))?;

    let err = manager.bind::<ServerConfig>().unwrap_err();
    assert!(matches!(err, ConfigError::Bind(ref e) if e.paths() == vec!["port"]));
    Ok(())
}

#[test]
fn test_bind_with_update_delivers_fresh_instances() -> Result<()> {
    let (env, handle) = memory("env", &[("HTTP_PORT", "9090")]);
    let manager = Manager::new(vec![env], Duration::from_millis(20))?;
    wait_watching(&handle);

    let updates = Arc::new(Mutex::new(Vec::new()));
    let u = updates.clone();
    let (initial, _sub) = manager.bind_with_update(move |server: ServerConfig| {
        u.lock().unwrap().push(server);
    })?;
    assert_eq!(initial.port, 9090);

    handle.set(Snapshot::from_iter([("HTTP_PORT", "9191")]));
    assert!(wait_until(Duration::from_secs(2), || updates.lock().unwrap().len() == 1));

    // 初始值不受后续发布影响
    assert_eq!(initial.port, 9090);
    assert_eq!(updates.lock().unwrap()[0].port, 9191);
    Ok(())
}

#[test]
fn test_bind_with_update_skips_undecodable_snapshot() -> Result<()> {
    let (env, handle) = memory("env", &[("HTTP_PORT", "1")]);
    let manager = Manager::new(vec![env], Duration::from_millis(20))?;
    wait_watching(&handle);

    let ports = Arc::new(Mutex::new(Vec::new()));
    let p = ports.clone();
    let (_, _sub) = manager.bind_with_update(move |server: ServerConfig| {
        p.lock().unwrap().push(server.port);
    })?;

    handle.set(Snapshot::from_iter([("HTTP_PORT", "bad")]));
    assert!(wait_until(Duration::from_secs(2), || {
        manager.value("HTTP_PORT").as_deref() == Some("bad")
    }));

    handle.set(Snapshot::from_iter([("HTTP_PORT", "2")]));
    assert!(wait_until(Duration::from_secs(2), || !ports.lock().unwrap().is_empty()));

    assert_eq!(*ports.lock().unwrap(), vec![2]);
    Ok(())
}
