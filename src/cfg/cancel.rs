//! 协作式取消信号
//!
//! `Canceller` 持有唯一的发送端，`cancel()` 时丢弃它；所有 `CancelToken`
//! 持有的接收端随即断开，可以直接放进 `crossbeam::select!` 里等待。

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 取消信号的触发端
pub struct Canceller {
    sender: Mutex<Option<Sender<()>>>,
    token: CancelToken,
}

impl Canceller {
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            token: CancelToken {
                receiver,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// 触发取消，重复调用无副作用
    pub fn cancel(&self) {
        self.token.cancelled.store(true, Ordering::SeqCst);
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

// drop 时同样触发取消，保证 is_cancelled 与通道状态一致
impl Drop for Canceller {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// 取消信号的监听端
///
/// # 示例
/// ```
/// use dyncfg::cfg::Canceller;
/// use std::time::Duration;
///
/// let canceller = Canceller::new();
/// let token = canceller.token();
///
/// assert!(!token.wait_timeout(Duration::from_millis(10)));
/// canceller.cancel();
/// assert!(token.wait_timeout(Duration::from_millis(10)));
/// ```
#[derive(Clone)]
pub struct CancelToken {
    receiver: Receiver<()>,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 取消时断开的通道，用于 `crossbeam::select!`
    ///
    /// 发送端从不发送数据，`recv` 只会在取消后返回 `Err`。
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }

    /// 最多等待 `timeout`，返回是否已取消
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) | Ok(()) => self.is_cancelled(),
        }
    }

    /// 阻塞直到取消
    pub fn wait(&self) {
        while self.receiver.recv().is_ok() {}
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
