use dyncfg::cfg::{MemorySource, MemorySourceHandle, Source};
use std::thread;
use std::time::{Duration, Instant};

pub fn memory(name: &str, pairs: &[(&str, &str)]) -> (Box<dyn Source>, MemorySourceHandle) {
    let source = MemorySource::new(name, pairs.iter().copied().collect());
    let handle = source.handle();
    (Box::new(source), handle)
}

/// 等待监听线程订阅上内存源，避免更新先于 watch 发出
pub fn wait_watching(handle: &MemorySourceHandle) {
    assert!(wait_until(Duration::from_secs(2), || handle.watcher_count() > 0));
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// 输出测试中的日志，通过 RUST_LOG 控制级别
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
