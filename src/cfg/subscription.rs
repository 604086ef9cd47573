//! 订阅注册表
//!
//! 每次发布新快照时调用已注册的回调。回调之间互相隔离：
//! 某个回调返回错误或 panic，只记录日志，不影响其他回调和后续发布。

use anyhow::Result;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::snapshot::Snapshot;

/// 订阅回调
pub type Callback = Arc<dyn Fn(&Snapshot) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Entries {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

pub(crate) struct SubscriptionRegistry {
    entries: Mutex<Entries>,
    closed: AtomicBool,
    delivered: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // 回调在锁外执行，锁不会因回调 panic 而中毒；这里仍然容忍中毒
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn subscribe(self: &Arc<Self>, callback: Callback) -> Subscription {
        let id = {
            let mut entries = self.lock();
            let id = entries.next_id;
            entries.next_id += 1;
            if !self.closed.load(Ordering::SeqCst) {
                entries.callbacks.insert(id, callback);
            }
            id
        };
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) -> bool {
        self.lock().callbacks.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// 停止接受新回调并清空已有回调
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock().callbacks.clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 成功调用的回调总数
    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// 依次调用所有回调
    ///
    /// 先在锁内复制回调列表，再在锁外调用，慢回调不会阻塞注册和注销。
    pub(crate) fn notify(&self, snapshot: &Snapshot) {
        let callbacks: Vec<(u64, Callback)> = self
            .lock()
            .callbacks
            .iter()
            .map(|(id, cb)| (*id, cb.clone()))
            .collect();

        for (id, callback) in callbacks {
            if self.is_closed() {
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| callback(snapshot))) {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                }
                Ok(Err(e)) => {
                    tracing::warn!(subscription = id, error = %e, "subscription callback failed");
                }
                Err(payload) => {
                    tracing::warn!(
                        subscription = id,
                        panic = %panic_message(payload.as_ref()),
                        "subscription callback panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// 订阅句柄
///
/// 调用 `unsubscribe` 取消订阅。直接丢弃句柄不会取消订阅，
/// 回调会一直保留到 `Manager` 关闭。
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 取消订阅，返回回调此前是否仍处于注册状态
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.unsubscribe(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
