//! 多来源动态配置管理
//!
//! `Manager` 按注册顺序持有多个配置源，启动时同步加载并合并，之后为每个源
//! 启动一个监听线程，把变更转发给唯一的合并协调线程。协调线程负责防抖、
//! 合并、校验、去重和发布。
//!
//! ```text
//! Source[0..N] --watch--> 监听线程 x N --(index, snapshot)--> 协调线程
//!                                                   |
//!                          ActiveState <--publish---+---notify--> 订阅回调
//! ```

use crossbeam::channel::{self, Receiver, Sender};
use garde::Validate;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::bind::{self, Bind};
use super::cancel::{CancelToken, Canceller};
use super::duration::{serde_as, HumanDur};
use super::error::{ConfigError, Result};
use super::registry::create_source;
use super::snapshot::Snapshot;
use super::source::{ConfigChange, Source};
use super::state::ActiveState;
use super::subscription::{Subscription, SubscriptionRegistry};
use super::type_options::TypeOptions;

/// 合并结果校验钩子，返回错误时丢弃本次合并结果
pub type Validator = Arc<dyn Fn(&Snapshot) -> anyhow::Result<()> + Send + Sync>;

/// Manager 配置
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault, Validate)]
#[serde(default)]
pub struct ManagerConfig {
    /// 防抖窗口，窗口内的多次变更合并为一次发布
    #[serde_as(as = "HumanDur")]
    #[default(Duration::from_millis(200))]
    #[garde(custom(validate_debounce))]
    pub debounce: Duration,

    /// 关闭时等待监听线程退出的最长时间
    #[serde_as(as = "HumanDur")]
    #[default(Duration::from_secs(3))]
    #[garde(custom(validate_shutdown_grace))]
    pub shutdown_grace: Duration,

    /// 通过注册表创建的配置源，优先级排在显式传入的配置源之后
    #[garde(skip)]
    pub sources: Vec<TypeOptions>,
}

fn validate_debounce(value: &Duration, _ctx: &()) -> garde::Result {
    if *value > Duration::from_secs(3600) {
        return Err(garde::Error::new("debounce must not exceed 1h"));
    }
    Ok(())
}

fn validate_shutdown_grace(value: &Duration, _ctx: &()) -> garde::Result {
    if *value < Duration::from_millis(10) || *value > Duration::from_secs(300) {
        return Err(garde::Error::new("shutdown_grace must be between 10ms and 5m"));
    }
    Ok(())
}

impl ManagerConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Manager 的运行时选项
#[derive(Clone, Default)]
pub struct ManagerOptions {
    validator: Option<Validator>,
    cancel: Option<CancelToken>,
}

impl ManagerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布前校验合并结果；启动时的初始合并结果同样需要通过校验
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Snapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// 外部取消信号，触发后 Manager 停止所有后台线程
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// 协调线程收到的来源变更
struct SourceEvent {
    index: usize,
    snapshot: Snapshot,
}

struct Shared {
    names: Vec<String>,
    state: ActiveState,
    subscriptions: Arc<SubscriptionRegistry>,
    degraded: Vec<OnceCell<String>>,
    running_watchers: AtomicUsize,
    publishes: AtomicU64,
    canceller: Canceller,
}

impl Shared {
    fn mark_degraded(&self, index: usize, reason: String) {
        // 同一个源只记录一次
        if self.degraded[index].set(reason.clone()).is_ok() {
            tracing::warn!(
                source = %self.names[index],
                error = %reason,
                "config source degraded, keeping last snapshot"
            );
        }
    }
}

/// 多来源动态配置管理器
///
/// # 示例
/// ```
/// use dyncfg::cfg::{Manager, MemorySource, Snapshot, Source};
/// use std::time::Duration;
///
/// let env = MemorySource::new("env", Snapshot::from_iter([("FOO", "1")]));
/// let map = MemorySource::new("map", Snapshot::from_iter([("FOO", "2"), ("BAR", "3")]));
///
/// let sources: Vec<Box<dyn Source>> = vec![Box::new(env), Box::new(map)];
/// let manager = Manager::new(sources, Duration::from_millis(200)).unwrap();
///
/// assert_eq!(manager.value("FOO").as_deref(), Some("2"));
/// assert_eq!(manager.value("BAR").as_deref(), Some("3"));
/// ```
pub struct Manager {
    shared: Arc<Shared>,
    shutdown_grace: Duration,
    coordinator: Mutex<Option<CoordinatorHandle>>,
}

/// 协调线程句柄；线程退出时 `exited` 断开
struct CoordinatorHandle {
    thread: JoinHandle<()>,
    exited: Receiver<()>,
}

impl Manager {
    /// 使用默认配置创建，仅指定防抖窗口
    pub fn new(sources: Vec<Box<dyn Source>>, debounce: Duration) -> Result<Self> {
        Self::with_options(
            sources,
            ManagerConfig::default().with_debounce(debounce),
            ManagerOptions::default(),
        )
    }

    /// 完全通过配置创建，配置源从注册表构造
    ///
    /// # 示例
    /// ```
    /// use dyncfg::cfg::{Manager, ManagerConfig, ManagerOptions};
    ///
    /// let config: ManagerConfig = serde_json::from_str(r#"{
    ///     "debounce": "100ms",
    ///     "sources": [
    ///         {"type": "MemorySource", "options": {"values": {"PORT": "8080"}}}
    ///     ]
    /// }"#).unwrap();
    ///
    /// let manager = Manager::from_config(config, ManagerOptions::new()).unwrap();
    /// assert_eq!(manager.value("PORT").as_deref(), Some("8080"));
    /// ```
    pub fn from_config(config: ManagerConfig, options: ManagerOptions) -> Result<Self> {
        Self::with_options(Vec::new(), config, options)
    }

    /// 创建 Manager
    ///
    /// 按注册顺序同步调用每个源的 `load`，任何一个失败都直接返回错误；
    /// 越靠后的源优先级越高。`config.sources` 中的源追加在 `sources` 之后。
    pub fn with_options(
        mut sources: Vec<Box<dyn Source>>,
        config: ManagerConfig,
        options: ManagerOptions,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        for type_options in &config.sources {
            sources.push(create_source(type_options)?);
        }

        let names: Vec<String> = sources.iter().map(|s| s.name()).collect();

        let mut last = Vec::with_capacity(sources.len());
        for (source, name) in sources.iter().zip(&names) {
            let snapshot = source.load().map_err(|cause| ConfigError::SourceLoad {
                source_name: name.clone(),
                cause,
            })?;
            last.push(snapshot);
        }

        let initial = Snapshot::merge(&last);
        if let Some(validator) = &options.validator {
            run_validator(validator, &initial).map_err(ConfigError::Validation)?;
        }

        let shared = Arc::new(Shared {
            degraded: names.iter().map(|_| OnceCell::new()).collect(),
            names,
            state: ActiveState::new(initial.clone()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            running_watchers: AtomicUsize::new(0),
            publishes: AtomicU64::new(0),
            canceller: Canceller::new(),
        });

        tracing::info!(
            sources = shared.names.len(),
            keys = initial.len(),
            debounce = ?config.debounce,
            "config manager started"
        );

        let (event_tx, event_rx) = channel::unbounded();
        let (done_tx, done_rx) = channel::bounded::<()>(0);
        for (index, source) in sources.into_iter().enumerate() {
            spawn_watcher(
                index,
                Arc::from(source),
                shared.clone(),
                event_tx.clone(),
                done_tx.clone(),
            );
        }
        drop(event_tx);
        drop(done_tx);

        let coordinator = Coordinator {
            shared: shared.clone(),
            last,
            debounce: config.debounce,
            shutdown_grace: config.shutdown_grace,
            validator: options.validator,
        };
        let external = options.cancel;
        let (exit_tx, exit_rx) = channel::bounded::<()>(0);
        let handle = match thread::Builder::new()
            .name("dyncfg-coordinator".to_string())
            .spawn(move || {
                let _exit = exit_tx;
                coordinator.run(event_rx, done_rx, external)
            }) {
            Ok(handle) => handle,
            Err(e) => {
                shared.canceller.cancel();
                return Err(ConfigError::InvalidConfig(format!(
                    "failed to spawn coordinator: {}",
                    e
                )));
            }
        };

        Ok(Self {
            shared,
            shutdown_grace: config.shutdown_grace,
            coordinator: Mutex::new(Some(CoordinatorHandle {
                thread: handle,
                exited: exit_rx,
            })),
        })
    }

    /// 当前生效的完整快照，不阻塞
    pub fn snapshot(&self) -> Snapshot {
        self.shared.state.snapshot()
    }

    /// 读取单个 key
    pub fn value(&self, key: &str) -> Option<String> {
        self.shared.state.value(key)
    }

    /// 把当前快照解码为 `T`
    pub fn bind<T: Bind>(&self) -> Result<T> {
        Ok(bind::decode(&self.snapshot())?)
    }

    /// 解码当前快照，并在之后每次发布时解码出新的 `T` 交给回调
    ///
    /// 返回的初始值之后不会被修改；每次更新都是独立的新实例。
    /// 更新时解码失败会记录日志并跳过本次回调。
    pub fn bind_with_update<T, F>(&self, callback: F) -> Result<(T, Subscription)>
    where
        T: Bind + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let initial = self.bind::<T>()?;
        let subscription = self.on_update(move |snapshot| {
            let fresh = bind::decode::<T>(snapshot)?;
            callback(fresh);
            Ok(())
        });
        Ok((initial, subscription))
    }

    /// 注册发布回调，回调在协调线程中执行
    pub fn on_update<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.subscriptions.subscribe(Arc::new(callback))
    }

    /// 当前有效的订阅数
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.len()
    }

    /// 注册顺序（即优先级从低到高）的配置源名称
    pub fn source_names(&self) -> &[String] {
        &self.shared.names
    }

    /// 已降级的配置源名称
    pub fn degraded_sources(&self) -> Vec<String> {
        self.shared
            .names
            .iter()
            .zip(&self.shared.degraded)
            .filter(|(_, cell)| cell.get().is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// 仍在运行的监听线程数
    pub fn running_watchers(&self) -> usize {
        self.shared.running_watchers.load(Ordering::SeqCst)
    }

    /// 已发布的次数，不含启动时的初始快照
    pub fn publish_count(&self) -> u64 {
        self.shared.publishes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.canceller.is_cancelled()
    }

    /// 停止所有后台线程
    ///
    /// 之后不再调用任何订阅回调；最多等待 `shutdown_grace`，协调线程仍未退出
    /// （例如卡在某个订阅回调里）时记录告警并放弃等待。重复调用无副作用。
    pub fn close(&self) {
        self.shared.subscriptions.close();
        self.shared.canceller.cancel();

        let handle = self
            .coordinator
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(handle) = handle else { return };

        // 在协调线程自身（订阅回调）中关闭时不能等待自己
        if handle.thread.thread().id() == thread::current().id() {
            return;
        }

        match handle.exited.recv_timeout(self.shutdown_grace) {
            Err(channel::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    grace = ?self.shutdown_grace,
                    "coordinator did not exit within grace period, detaching"
                );
            }
            _ => {
                let _ = handle.thread.join();
            }
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_validator(validator: &Validator, snapshot: &Snapshot) -> std::result::Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| validator(snapshot))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("validator panicked".to_string()),
    }
}

/// 监听线程退出时递减计数
struct WatcherGuard {
    shared: Arc<Shared>,
    _done: Sender<()>,
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.shared.running_watchers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_watcher(
    index: usize,
    source: Arc<dyn Source>,
    shared: Arc<Shared>,
    events: Sender<SourceEvent>,
    done: Sender<()>,
) {
    shared.running_watchers.fetch_add(1, Ordering::SeqCst);
    let name = shared.names[index].clone();
    let spawned = thread::Builder::new()
        .name(format!("dyncfg-watch-{}", index))
        .spawn({
            let shared = shared.clone();
            move || {
                let guard = WatcherGuard {
                    shared,
                    _done: done,
                };
                watch_source(index, source, &guard.shared, &events);
            }
        });
    if let Err(e) = spawned {
        // 闭包已被丢弃，guard 未创建，需要手动回退计数
        shared.running_watchers.fetch_sub(1, Ordering::SeqCst);
        shared.mark_degraded(index, format!("failed to spawn watcher for {}: {}", name, e));
    }
}

fn watch_source(index: usize, source: Arc<dyn Source>, shared: &Shared, events: &Sender<SourceEvent>) {
    let cancel = shared.canceller.token();
    let stream = match source.watch(cancel.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            let err = ConfigError::SourceWatch {
                source_name: shared.names[index].clone(),
                message: e.to_string(),
            };
            shared.mark_degraded(index, err.to_string());
            return;
        }
    };

    loop {
        crossbeam::select! {
            recv(cancel.receiver()) -> _ => break,
            recv(stream) -> change => match change {
                Ok(ConfigChange::Updated(snapshot)) => {
                    if events.send(SourceEvent { index, snapshot }).is_err() {
                        break;
                    }
                }
                Ok(ConfigChange::Error(message)) => {
                    let err = ConfigError::SourceWatch {
                        source_name: shared.names[index].clone(),
                        message,
                    };
                    shared.mark_degraded(index, err.to_string());
                    break;
                }
                Err(_) => {
                    tracing::debug!(source = %shared.names[index], "watch stream ended");
                    break;
                }
            }
        }
    }
}

/// 合并协调线程，唯一的 ActiveState 写入方和订阅回调调用方
struct Coordinator {
    shared: Arc<Shared>,
    last: Vec<Snapshot>,
    debounce: Duration,
    shutdown_grace: Duration,
    validator: Option<Validator>,
}

impl Coordinator {
    fn run(
        mut self,
        events: Receiver<SourceEvent>,
        done: Receiver<()>,
        external: Option<CancelToken>,
    ) {
        let internal = self.shared.canceller.token();
        let external_rx = match &external {
            Some(token) => token.receiver().clone(),
            None => channel::never(),
        };
        let closed_events = channel::never();
        let mut events_open = true;
        let mut deadline: Option<Instant> = None;

        loop {
            let timer = match deadline {
                Some(at) => channel::at(at),
                None => channel::never(),
            };
            let events_rx = if events_open { &events } else { &closed_events };

            crossbeam::select! {
                recv(internal.receiver()) -> _ => break,
                recv(external_rx) -> _ => break,
                recv(events_rx) -> event => match event {
                    Ok(SourceEvent { index, snapshot }) => {
                        // 缓存立即更新，发布延迟到窗口结束
                        self.last[index] = snapshot;
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    // 所有监听线程都已退出，继续等待取消
                    Err(_) => events_open = false,
                },
                recv(timer) -> _ => {
                    deadline = None;
                    self.publish();
                }
            }
        }

        self.shutdown(done);
    }

    fn publish(&self) {
        if self.shared.canceller.is_cancelled() {
            return;
        }

        let merged = Snapshot::merge(&self.last);

        if let Some(validator) = &self.validator {
            if let Err(reason) = run_validator(validator, &merged) {
                let err = ConfigError::Validation(reason);
                tracing::warn!(error = %err, "discarding merged snapshot");
                return;
            }
        }

        if merged == self.shared.state.snapshot() {
            tracing::debug!("merged snapshot unchanged, skip publish");
            return;
        }

        self.shared.state.publish(&merged);
        self.shared.publishes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(keys = merged.len(), "published merged snapshot");

        self.shared.subscriptions.notify(&merged);
    }

    fn shutdown(self, done: Receiver<()>) {
        // 先关闭订阅，未触发的防抖定时器随循环退出一并丢弃
        self.shared.subscriptions.close();
        self.shared.canceller.cancel();

        // 每个监听线程退出时丢弃一个 done 发送端，全部退出后通道断开
        if let Err(channel::RecvTimeoutError::Timeout) = done.recv_timeout(self.shutdown_grace) {
            tracing::warn!(
                running = self.shared.running_watchers.load(Ordering::SeqCst),
                grace = ?self.shutdown_grace,
                "watchers did not exit within grace period"
            );
        }

        tracing::info!(
            publishes = self.shared.publishes.load(Ordering::SeqCst),
            delivered = self.shared.subscriptions.delivered(),
            "config manager stopped"
        );
    }
}
