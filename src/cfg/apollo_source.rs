//! Apollo 配置中心源
//!
//! 将 Apollo 命名空间下的全部 key 作为一个快照，通过长轮询监听变化

use anyhow::{anyhow, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use super::cancel::CancelToken;
use super::duration::{serde_as, HumanDur};
use super::snapshot::Snapshot;
use super::source::{ConfigChange, Source, WatchStream};
use crate::impl_box_from;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_PAUSE: Duration = Duration::from_millis(100);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Apollo 配置中心源的配置
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApolloSourceConfig {
    /// Apollo 服务器地址，如 "http://localhost:8080"
    pub server_url: String,
    /// 应用 ID
    pub app_id: String,
    /// 命名空间，默认为 "application"
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 集群名称，默认为 "default"
    #[serde(default = "default_cluster")]
    pub cluster: String,
    /// 长轮询请求超时，需大于服务端挂起时间
    #[serde_as(as = "HumanDur")]
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: Duration,
}

fn default_namespace() -> String {
    "application".to_string()
}

fn default_cluster() -> String {
    "default".to_string()
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(90)
}

#[derive(Debug, Deserialize)]
struct ApolloResponse {
    configurations: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ApolloNotification {
    #[serde(rename = "notificationId")]
    notification_id: i64,
}

/// Apollo 配置中心源
///
/// # 监听行为说明
/// - 每次 notificationId 变化（包括第一次通知）都会重新拉取整个命名空间并推送，
///   load 之后发布的变更不会丢失，内容未变时由 Manager 去重
/// - 请求失败时按指数退避重试，成功后退避重置，每轮轮询之间检查取消信号
///
/// # 示例
/// ```no_run
/// use dyncfg::cfg::{ApolloSource, ApolloSourceConfig, Source};
///
/// let source = ApolloSource::new(serde_json::from_str::<ApolloSourceConfig>(r#"{
///     "server_url": "http://localhost:8080",
///     "app_id": "my-app"
/// }"#).unwrap()).unwrap();
///
/// let snapshot = source.load().unwrap();
/// ```
#[derive(Clone)]
pub struct ApolloSource {
    server_url: String,
    app_id: String,
    namespace: String,
    cluster: String,
    poll_timeout: Duration,
    client: reqwest::blocking::Client,
}

impl ApolloSource {
    pub fn new(config: ApolloSourceConfig) -> Result<Self> {
        Ok(Self {
            server_url: config.server_url.trim_end_matches('/').to_string(),
            app_id: config.app_id,
            namespace: config.namespace,
            cluster: config.cluster,
            poll_timeout: config.poll_timeout,
            client: reqwest::blocking::Client::builder().build()?,
        })
    }
}

impl_box_from!(ApolloSource => dyn Source);

impl ApolloSource {
    /// 拉取命名空间的完整配置
    fn fetch(&self) -> Result<Snapshot> {
        let url = format!(
            "{}/configs/{}/{}/{}",
            self.server_url, self.app_id, self.cluster, self.namespace
        );

        let resp = self
            .client
            .get(&url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .map_err(|e| anyhow!("request apollo failed: {}", e))?;

        if !resp.status().is_success() {
            return Err(anyhow!("apollo returned status {}", resp.status()));
        }

        let body = resp
            .json::<ApolloResponse>()
            .map_err(|e| anyhow!("decode apollo response failed: {}", e))?;

        // 非字符串的值按 JSON 编码保存
        Ok(body
            .configurations
            .into_iter()
            .map(|(k, v)| match v {
                JsonValue::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }

    /// 发起一次长轮询，返回最新的 notificationId；304 表示没有变化
    fn poll(&self, notification_id: i64) -> Result<Option<i64>> {
        let url = format!("{}/notifications/v2", self.server_url);
        let params = serde_json::json!([{
            "namespaceName": self.namespace,
            "notificationId": notification_id,
        }])
        .to_string();

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("appId", self.app_id.as_str()),
                ("cluster", self.cluster.as_str()),
                ("notifications", params.as_str()),
            ])
            .timeout(self.poll_timeout)
            .send()
            .map_err(|e| anyhow!("request apollo failed: {}", e))?;

        if resp.status().as_u16() == 304 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow!("apollo returned status {}", resp.status()));
        }

        let notifications = resp
            .json::<Vec<ApolloNotification>>()
            .map_err(|e| anyhow!("decode apollo notifications failed: {}", e))?;
        Ok(notifications.first().map(|n| n.notification_id))
    }

    fn watch_loop(&self, cancel: CancelToken, tx: Sender<ConfigChange>) {
        let name = self.name();
        let mut notification_id: Option<i64> = None;
        let mut backoff = retry_policy().build();

        while !cancel.is_cancelled() {
            let result = self
                .poll(notification_id.unwrap_or(-1))
                .and_then(|id| match id {
                    Some(id) if Some(id) != notification_id => {
                        // 拉取成功后才记录 id，失败时下一轮重新拉取
                        let snapshot = self.fetch()?;
                        notification_id = Some(id);
                        Ok(Some(snapshot))
                    }
                    _ => Ok(None),
                });

            match result {
                Ok(Some(snapshot)) => {
                    backoff = retry_policy().build();
                    if tx.send(ConfigChange::Updated(snapshot)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    backoff = retry_policy().build();
                    if cancel.wait_timeout(POLL_PAUSE) {
                        return;
                    }
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(MAX_BACKOFF);
                    tracing::warn!(
                        source = %name,
                        error = %e,
                        retry_in = ?delay,
                        "apollo poll failed"
                    );
                    if cancel.wait_timeout(delay) {
                        return;
                    }
                }
            }
        }
    }
}

/// 轮询失败的退避策略：从 MIN_BACKOFF 开始翻倍，不超过 MAX_BACKOFF，不限次数
fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(MIN_BACKOFF)
        .with_max_delay(MAX_BACKOFF)
        .with_factor(2.0)
        .with_max_times(usize::MAX)
}

impl Source for ApolloSource {
    fn name(&self) -> String {
        format!("apollo:{}/{}/{}", self.app_id, self.cluster, self.namespace)
    }

    fn load(&self) -> Result<Snapshot> {
        self.fetch()
    }

    fn watch(&self, cancel: CancelToken) -> Result<WatchStream> {
        let (tx, rx) = channel::unbounded();
        let source = self.clone();
        thread::Builder::new()
            .name(format!("apollo-watch-{}", self.namespace))
            .spawn(move || source.watch_loop(cancel, tx))?;
        Ok(rx)
    }
}
