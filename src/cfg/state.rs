//! 当前生效配置的持有者
//!
//! 写入方只有合并协调线程，读取方可以任意多。读取通过 `ArcSwap` 完成，
//! 不加锁，也不会读到合并到一半的数据。

use arc_swap::ArcSwap;
use std::collections::BTreeMap;

use super::snapshot::Snapshot;

pub(crate) struct ActiveState {
    current: ArcSwap<BTreeMap<String, String>>,
}

impl ActiveState {
    pub(crate) fn new(initial: Snapshot) -> Self {
        Self {
            current: ArcSwap::new(initial.as_arc().clone()),
        }
    }

    /// 整体取出当前快照，之后的发布不会影响已取出的引用
    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::from_arc(self.current.load_full())
    }

    pub(crate) fn value(&self, key: &str) -> Option<String> {
        self.current.load().get(key).cloned()
    }

    /// 原子替换，返回被替换掉的快照
    pub(crate) fn publish(&self, next: &Snapshot) -> Snapshot {
        Snapshot::from_arc(self.current.swap(next.as_arc().clone()))
    }
}
