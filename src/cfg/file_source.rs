//! 文件配置源
//!
//! 支持从本地文件加载配置，支持 JSON/JSON5/YAML/TOML/dotenv 格式。
//! 嵌套结构会被展开成扁平的 key，如 `database.host`。
//! 支持监听文件变化并自动重新加载。

use anyhow::{anyhow, bail, Result};
use crossbeam::channel::unbounded;
use notify::{recommended_watcher, Event, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use smart_default::SmartDefault;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::cancel::CancelToken;
use super::snapshot::Snapshot;
use super::source::{ConfigChange, Source, WatchStream};
use crate::{impl_box_from, impl_from};

// 同一次保存往往触发多个修改事件，等待这段时间后只读取一次
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// 文件配置源的配置
#[derive(Debug, Clone, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct FileSourceConfig {
    /// 配置文件路径
    pub path: String,
    /// 文件格式，不设置时根据扩展名推断
    pub format: Option<FileFormat>,
    /// 展开嵌套结构时使用的分隔符
    #[default = "."]
    pub separator: String,
}

/// 支持的文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Json,
    Json5,
    Yaml,
    Toml,
    /// `KEY=VALUE` 逐行格式
    Env,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        let format = match ext.as_str() {
            "json" => Self::Json,
            "json5" => Self::Json5,
            "yaml" | "yml" => Self::Yaml,
            "toml" => Self::Toml,
            "env" => Self::Env,
            _ => return None,
        };
        Some(format)
    }
}

/// 文件配置源
///
/// # 示例
/// ```no_run
/// use dyncfg::cfg::{FileSource, FileSourceConfig, Source};
///
/// let source = FileSource::new(FileSourceConfig {
///     path: "config/app.yaml".to_string(),
///     ..Default::default()
/// });
///
/// // database: { host: localhost } -> database.host = localhost
/// let snapshot = source.load().unwrap();
/// ```
pub struct FileSource {
    path: PathBuf,
    format: Option<FileFormat>,
    separator: String,
}

impl FileSource {
    pub fn new(config: FileSourceConfig) -> Self {
        Self {
            path: config.path.into(),
            format: config.format,
            separator: config.separator,
        }
    }
}

impl_from!(FileSourceConfig => FileSource);
impl_box_from!(FileSource => dyn Source);

impl FileSource {
    fn format(&self) -> Result<FileFormat> {
        self.format
            .or_else(|| FileFormat::from_path(&self.path))
            .ok_or_else(|| anyhow!("cannot infer config format from {}", self.path.display()))
    }

    fn read_snapshot(&self) -> Result<Snapshot> {
        let format = self.format()?;
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| anyhow!("failed to read {}: {}", self.path.display(), e))?;
        parse_content(&content, format, &self.separator)
    }
}

/// 解析文件内容并展开为扁平快照
fn parse_content(content: &str, format: FileFormat, separator: &str) -> Result<Snapshot> {
    let value: JsonValue = match format {
        FileFormat::Json => serde_json::from_str(content)?,
        FileFormat::Json5 => json5::from_str(content)?,
        FileFormat::Yaml => serde_yaml::from_str(content)?,
        FileFormat::Toml => toml::from_str(content)?,
        FileFormat::Env => return Ok(parse_dotenv(content)?.into()),
    };

    let mut entries = BTreeMap::new();
    match value {
        JsonValue::Object(map) => {
            for (key, value) in map {
                flatten(key, value, separator, &mut entries);
            }
        }
        // 空 YAML 文件解析为 null
        JsonValue::Null => {}
        other => bail!("top-level config must be a table, got {}", other),
    }
    Ok(entries.into())
}

fn flatten(key: String, value: JsonValue, separator: &str, out: &mut BTreeMap<String, String>) {
    match value {
        JsonValue::Null => {}
        JsonValue::String(s) => {
            out.insert(key, s);
        }
        JsonValue::Bool(b) => {
            out.insert(key, b.to_string());
        }
        JsonValue::Number(n) => {
            out.insert(key, n.to_string());
        }
        JsonValue::Array(_) => {
            out.insert(key, value.to_string());
        }
        JsonValue::Object(map) => {
            for (child, value) in map {
                flatten(format!("{}{}{}", key, separator, child), value, separator, out);
            }
        }
    }
}

fn parse_dotenv(content: &str) -> Result<BTreeMap<String, String>> {
    dotenvy::from_read_iter(content.as_bytes())
        .map(|item| item.map_err(|e| anyhow!("invalid dotenv content: {}", e)))
        .collect()
}

impl Source for FileSource {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn load(&self) -> Result<Snapshot> {
        self.read_snapshot()
    }

    fn watch(&self, cancel: CancelToken) -> Result<WatchStream> {
        let file_path = dunce::canonicalize(&self.path)
            .map_err(|e| anyhow!("failed to resolve {}: {}", self.path.display(), e))?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| anyhow!("not a file: {}", file_path.display()))?;
        let dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("no parent directory: {}", file_path.display()))?;

        // 监听所在目录，编辑器“写临时文件再重命名”的保存方式也能被捕获
        let (event_tx, event_rx) = unbounded();
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = event_tx.send(event);
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let source = FileSource {
            path: file_path.clone(),
            format: Some(self.format()?),
            separator: self.separator.clone(),
        };
        let name = self.name();
        let (tx, rx) = unbounded();

        // 监听已注册后再读取一次作为基线并推送，load 之后、监听建立之前的修改不会丢失；
        // 内容未变时由 Manager 去重
        let mut last = source.read_snapshot().ok();
        if let Some(snapshot) = &last {
            let _ = tx.send(ConfigChange::Updated(snapshot.clone()));
        }

        thread::spawn(move || {
            let touches_file = |event: &Event| {
                event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
            };

            loop {
                crossbeam::select! {
                    recv(cancel.receiver()) -> _ => break,
                    recv(event_rx) -> event => {
                        let Ok(event) = event else { break };
                        if !touches_file(&event) {
                            continue;
                        }

                        // 防抖：等待后丢弃这段时间内的重复事件
                        if cancel.wait_timeout(WATCH_DEBOUNCE) {
                            break;
                        }
                        while event_rx.try_recv().is_ok() {}

                        if !source.path.exists() {
                            let _ = tx.send(ConfigChange::Error(format!(
                                "config file removed: {}",
                                source.path.display()
                            )));
                            break;
                        }

                        match source.read_snapshot() {
                            Ok(snapshot) if last.as_ref() != Some(&snapshot) => {
                                last = Some(snapshot.clone());
                                if tx.send(ConfigChange::Updated(snapshot)).is_err() {
                                    break;
                                }
                            }
                            Ok(_) => {}
                            // 可能读到写了一半的文件，等待下一次事件
                            Err(e) => {
                                tracing::warn!(source = %name, error = %e, "failed to reload config file");
                            }
                        }
                    }
                }
            }

            // 显式 drop watcher 以释放文件句柄
            drop(watcher);
        });

        Ok(rx)
    }
}
