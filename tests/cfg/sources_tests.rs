use anyhow::Result;
use dyncfg::cfg::{
    create_source, EnvSource, EnvSourceConfig, FileSource, FileSourceConfig, Manager,
    MemorySource, Snapshot, Source, TypeOptions,
};
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use crate::common::{init_tracing, wait_until};

#[test]
#[serial]
fn test_defaults_file_env_layering() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("app.yaml");
    fs::write(
        &path,
        r#"
HTTP_PORT: 7070
LOG_LEVEL: warn
"#,
    )?;
    std::env::set_var("DYNCFG_IT_LOG_LEVEL", "debug");

    let defaults = MemorySource::new(
        "defaults",
        Snapshot::from_iter([("HTTP_PORT", "8080"), ("LOG_LEVEL", "info"), ("REGION", "cn")]),
    );
    let file = FileSource::new(FileSourceConfig {
        path: path.to_string_lossy().to_string(),
        ..Default::default()
    });
    let env = EnvSource::new(EnvSourceConfig {
        prefix: "DYNCFG_IT_".to_string(),
        strip_prefix: true,
        ..Default::default()
    });

    let sources: Vec<Box<dyn Source>> = vec![Box::new(defaults), Box::new(file), Box::new(env)];
    let manager = Manager::new(sources, Duration::from_millis(50))?;

    assert_eq!(
        manager.snapshot(),
        Snapshot::from_iter([("HTTP_PORT", "7070"), ("LOG_LEVEL", "debug"), ("REGION", "cn")])
    );

    std::env::remove_var("DYNCFG_IT_LOG_LEVEL");
    Ok(())
}

#[test]
fn test_file_change_is_published() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("app.json");
    fs::write(&path, r#"{"server": {"port": 8080}}"#)?;

    let source = create_source(&TypeOptions::from_json(&format!(
        r#"{{"type": "FileSource", "options": {{"path": {:?}}}}}"#,
        path.to_string_lossy()
    ))?)?;
    let manager = Manager::new(vec![source], Duration::from_millis(50))?;
    assert_eq!(manager.value("server.port").as_deref(), Some("8080"));

    // 等待监听线程建立文件监听
    std::thread::sleep(Duration::from_millis(200));
    fs::write(&path, r#"{"server": {"port": 9090}}"#)?;

    assert!(wait_until(Duration::from_secs(5), || {
        manager.value("server.port").as_deref() == Some("9090")
    }));
    Ok(())
}

#[test]
fn test_deleted_file_degrades_and_keeps_last_values() -> Result<()> {
    init_tracing();
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("app.toml");
    fs::write(&path, "name = \"svc\"\n")?;

    let file = FileSource::new(FileSourceConfig {
        path: path.to_string_lossy().to_string(),
        ..Default::default()
    });
    let sources: Vec<Box<dyn Source>> = vec![Box::new(file)];
    let manager = Manager::new(sources, Duration::from_millis(20))?;

    std::thread::sleep(Duration::from_millis(200));
    fs::remove_file(&path)?;

    assert!(wait_until(Duration::from_secs(5), || {
        !manager.degraded_sources().is_empty()
    }));
    assert_eq!(manager.value("name").as_deref(), Some("svc"));
    Ok(())
}

#[test]
fn test_missing_file_fails_construction() {
    let temp_dir = TempDir::new().unwrap();
    let file = FileSource::new(FileSourceConfig {
        path: temp_dir.path().join("absent.yaml").to_string_lossy().to_string(),
        ..Default::default()
    });

    let sources: Vec<Box<dyn Source>> = vec![Box::new(file)];
    let err = Manager::new(sources, Duration::from_millis(20)).err().unwrap();
    assert!(err.to_string().starts_with("failed to load source file:"));
}
