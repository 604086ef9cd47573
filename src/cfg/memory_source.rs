//! 内存配置源
//!
//! 持有一份内存中的快照，可以通过 `MemorySourceHandle` 推送全量替换或终止错误。
//! 适合测试和程序内覆盖配置。

use anyhow::{anyhow, Result};
use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use super::cancel::CancelToken;
use super::snapshot::Snapshot;
use super::source::{ConfigChange, Source, WatchStream};
use crate::impl_from;

/// 内存配置源的配置
#[derive(Debug, Clone, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct MemorySourceConfig {
    /// 来源名称
    #[default = "memory"]
    pub name: String,
    /// 初始键值
    pub values: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    current: Snapshot,
    load_error: Option<String>,
    next_id: u64,
    watchers: Vec<(u64, Sender<ConfigChange>)>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// 内存配置源
///
/// # 示例
/// ```
/// use dyncfg::cfg::{MemorySource, Snapshot, Source};
///
/// let source = MemorySource::new("overrides", Snapshot::from_iter([("PORT", "8080")]));
/// let handle = source.handle();
///
/// handle.set(Snapshot::from_iter([("PORT", "9090")]));
/// assert_eq!(source.load().unwrap().get("PORT"), Some("9090"));
/// ```
pub struct MemorySource {
    name: String,
    shared: Arc<Shared>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, initial: Snapshot) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    current: initial,
                    ..State::default()
                }),
            }),
        }
    }

    pub fn from_config(config: MemorySourceConfig) -> Self {
        Self::new(config.name, Snapshot::from(config.values))
    }

    /// 获取推送句柄，可在任意线程使用
    pub fn handle(&self) -> MemorySourceHandle {
        MemorySourceHandle {
            shared: self.shared.clone(),
        }
    }
}

impl_from!(MemorySourceConfig => MemorySource, via: from_config);

impl Source for MemorySource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn load(&self) -> Result<Snapshot> {
        let state = self.shared.lock();
        match &state.load_error {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(state.current.clone()),
        }
    }

    fn watch(&self, cancel: CancelToken) -> Result<WatchStream> {
        let (tx, rx) = channel::unbounded();
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.watchers.push((id, tx));
            id
        };

        // 取消时移除发送端，监听流随之断开
        let shared = Arc::downgrade(&self.shared);
        thread::spawn(move || {
            cancel.wait();
            if let Some(shared) = shared.upgrade() {
                shared.lock().watchers.retain(|(wid, _)| *wid != id);
            }
        });

        Ok(rx)
    }
}

/// 内存配置源的推送句柄
#[derive(Clone)]
pub struct MemorySourceHandle {
    shared: Arc<Shared>,
}

impl MemorySourceHandle {
    /// 替换整个快照并推送给所有监听者
    pub fn set(&self, snapshot: impl Into<Snapshot>) {
        let snapshot = snapshot.into();
        let mut state = self.shared.lock();
        state.current = snapshot.clone();
        state
            .watchers
            .retain(|(_, tx)| tx.send(ConfigChange::Updated(snapshot.clone())).is_ok());
    }

    /// 向所有监听者发送终止错误，之后这些监听流都会断开
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let watchers = std::mem::take(&mut self.shared.lock().watchers);
        for (_, tx) in watchers {
            let _ = tx.send(ConfigChange::Error(message.clone()));
        }
    }

    /// 设置后 `load` 返回错误，传 `None` 恢复
    pub fn set_load_error(&self, message: Option<String>) {
        self.shared.lock().load_error = message;
    }

    /// 当前打开的监听流数量
    pub fn watcher_count(&self) -> usize {
        self.shared.lock().watchers.len()
    }
}
