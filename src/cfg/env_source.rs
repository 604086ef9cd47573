//! 环境变量配置源
//!
//! 按前缀筛选进程环境变量；可选地定时轮询，内容变化时推送新快照

use anyhow::Result;
use crossbeam::channel;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

use super::cancel::CancelToken;
use super::duration::{serde_as, HumanDur};
use super::snapshot::Snapshot;
use super::source::{ConfigChange, Source, WatchStream};
use crate::{impl_box_from, impl_from};

/// 环境变量配置源的配置
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvSourceConfig {
    /// 只保留以此开头的变量，空字符串表示全部
    pub prefix: String,
    /// 是否从 key 中去掉前缀
    pub strip_prefix: bool,
    /// 轮询间隔，不设置则不轮询
    #[serde_as(as = "Option<HumanDur>")]
    pub poll_interval: Option<Duration>,
}

/// 环境变量配置源
///
/// # 示例
/// ```no_run
/// use dyncfg::cfg::{EnvSource, EnvSourceConfig, Source};
///
/// let source = EnvSource::new(EnvSourceConfig {
///     prefix: "APP_".to_string(),
///     strip_prefix: true,
///     ..Default::default()
/// });
///
/// // APP_PORT=8080 -> PORT=8080
/// let snapshot = source.load().unwrap();
/// ```
pub struct EnvSource {
    config: EnvSourceConfig,
}

impl EnvSource {
    pub fn new(config: EnvSourceConfig) -> Self {
        Self { config }
    }

    fn read(&self) -> Snapshot {
        let prefix = self.config.prefix.as_str();
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .filter(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, v)| {
                let key = if self.config.strip_prefix {
                    k[prefix.len()..].to_string()
                } else {
                    k
                };
                // 去掉前缀后为空的变量没有意义
                (!key.is_empty()).then_some((key, v))
            })
            .collect()
    }
}

impl_from!(EnvSourceConfig => EnvSource);
impl_box_from!(EnvSource => dyn Source);

impl Source for EnvSource {
    fn name(&self) -> String {
        if self.config.prefix.is_empty() {
            "env".to_string()
        } else {
            format!("env:{}", self.config.prefix)
        }
    }

    fn load(&self) -> Result<Snapshot> {
        Ok(self.read())
    }

    fn watch(&self, cancel: CancelToken) -> Result<WatchStream> {
        let (tx, rx) = channel::unbounded();

        let Some(interval) = self.config.poll_interval.filter(|d| !d.is_zero()) else {
            // 不轮询：保持通道打开直到取消
            thread::spawn(move || {
                cancel.wait();
                drop(tx);
            });
            return Ok(rx);
        };

        // 先推送一次基线，覆盖 load 之后到开始轮询之间的变化
        let source = EnvSource::new(self.config.clone());
        let mut last = source.read();
        let _ = tx.send(ConfigChange::Updated(last.clone()));

        thread::spawn(move || {
            let ticker = channel::tick(interval);
            loop {
                crossbeam::select! {
                    recv(cancel.receiver()) -> _ => break,
                    recv(ticker) -> _ => {
                        let current = source.read();
                        if current != last {
                            last = current.clone();
                            if tx.send(ConfigChange::Updated(current)).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
