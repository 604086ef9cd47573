//! dyncfg - 多来源动态配置管理
//!
//! 从环境变量、配置文件、Apollo 配置中心等多个来源加载扁平的 key/value 配置，
//! 按注册顺序合并（后注册的优先），在后台监听变化并以防抖方式原子地发布新快照。
//!
//! ## 模块
//!
//! - **cfg**: 配置源、合并协调、订阅通知和强类型绑定
//!
//! ## 示例
//!
//! ```
//! use dyncfg::{Bind, Manager, MemorySource, Snapshot, Source};
//! use std::time::Duration;
//!
//! #[derive(Bind)]
//! struct Server {
//!     #[bind(key = "HTTP_PORT", default = "8080")]
//!     port: u16,
//! }
//!
//! let defaults = MemorySource::new("defaults", Snapshot::from_iter([("HTTP_PORT", "9090")]));
//! let sources: Vec<Box<dyn Source>> = vec![Box::new(defaults)];
//! let manager = Manager::new(sources, Duration::from_millis(200)).unwrap();
//!
//! let server: Server = manager.bind().unwrap();
//! assert_eq!(server.port, 9090);
//! ```

// 派生宏生成的代码通过 `::dyncfg::` 路径引用本 crate
extern crate self as dyncfg;

pub mod cfg;

// 重新导出主要的公共 API
pub use cfg::{
    create_source, decode, register_source, Bind, BindError, CancelToken, Canceller, ConfigChange,
    ConfigError, Manager, ManagerConfig, ManagerOptions, ParseValue, Snapshot, Source,
    Subscription, TypeOptions, WatchStream,
};

pub use cfg::{ApolloSource, ApolloSourceConfig};
pub use cfg::{EnvSource, EnvSourceConfig};
pub use cfg::{FileSource, FileSourceConfig};
pub use cfg::{MemorySource, MemorySourceConfig, MemorySourceHandle};
