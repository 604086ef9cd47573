//! cfg 模块 - 动态配置管理
//!
//! 从多个配置源（环境变量、文件、Apollo、内存）加载扁平的 key/value 快照，
//! 按优先级合并，在后台监听变化并以防抖方式发布新快照。
//!
//! - [`Manager`]: 持有当前生效的快照，负责合并、校验、发布和通知
//! - [`Source`]: 配置源抽象，`load` 返回完整快照，`watch` 返回变化流
//! - [`Bind`]: 通过 `#[derive(Bind)]` 把快照解码为强类型结构体

// 模块声明
pub mod apollo_source;
pub mod bind;
pub mod cancel;
pub mod duration;
pub mod env_source;
pub mod error;
pub mod file_source;
pub mod macros;
pub mod manager;
pub mod memory_source;
pub mod parse_value;
pub mod registry;
pub mod snapshot;
pub mod source;
mod state;
pub mod subscription;
pub mod type_options;

// 重新导出公共 API
pub use apollo_source::{ApolloSource, ApolloSourceConfig};
pub use bind::{decode, Bind, BindError, Decoder, FieldError, FieldErrorKind};
pub use cancel::{CancelToken, Canceller};
pub use duration::{format_duration, parse_duration, HumanDur};
pub use env_source::{EnvSource, EnvSourceConfig};
pub use error::{ConfigError, Result};
pub use file_source::{FileFormat, FileSource, FileSourceConfig};
pub use manager::{Manager, ManagerConfig, ManagerOptions, Validator};
pub use memory_source::{MemorySource, MemorySourceConfig, MemorySourceHandle};
pub use parse_value::{ParseError, ParseValue};
pub use registry::{create_source, register_source, registered_types};
pub use snapshot::Snapshot;
pub use source::{ConfigChange, Source, WatchStream};
pub use subscription::{Callback, Subscription};
pub use type_options::TypeOptions;
