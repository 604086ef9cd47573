//! 配置源抽象
//!
//! 提供统一的配置来源接口，支持环境变量、文件、配置中心等多种来源

use anyhow::Result;
use crossbeam::channel::Receiver;

use super::cancel::CancelToken;
use super::snapshot::Snapshot;

/// 配置变更事件
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    /// 配置更新，携带该来源的完整快照（全量替换，不是增量）
    Updated(Snapshot),
    /// 监听出错，之后不会再有事件
    Error(String),
}

/// 监听流
///
/// 通道断开表示监听正常结束。
pub type WatchStream = Receiver<ConfigChange>;

/// 配置来源抽象
///
/// 所有配置源（环境变量、文件、配置中心等）都实现此 trait，
/// `Manager` 只依赖这个接口，不感知具体来源。
///
/// # 示例
/// ```
/// use dyncfg::cfg::{CancelToken, ConfigChange, Snapshot, Source, WatchStream};
///
/// struct Fixed;
///
/// impl Source for Fixed {
///     fn name(&self) -> String {
///         "fixed".to_string()
///     }
///
///     fn load(&self) -> anyhow::Result<Snapshot> {
///         Ok(Snapshot::from_iter([("PORT", "8080")]))
///     }
///
///     fn watch(&self, cancel: CancelToken) -> anyhow::Result<WatchStream> {
///         let (tx, rx) = crossbeam::channel::unbounded::<ConfigChange>();
///         // 不会变化的来源：取消时丢弃发送端
///         std::thread::spawn(move || {
///             cancel.wait();
///             drop(tx);
///         });
///         Ok(rx)
///     }
/// }
/// ```
pub trait Source: Send + Sync {
    /// 来源名称，用于日志
    fn name(&self) -> String;

    /// 一次性读取完整快照
    fn load(&self) -> Result<Snapshot>;

    /// 监听配置变化
    ///
    /// # 约定
    /// - 每个 `Updated` 都是完整替换
    /// - `cancel` 触发后必须在有限时间内停止并断开通道
    /// - 监听仅推送**变化**，初始值应通过 `load` 获取
    fn watch(&self, cancel: CancelToken) -> Result<WatchStream>;
}
