// 配置源注册表和工厂函数

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::RwLock;

use super::apollo_source::{ApolloSource, ApolloSourceConfig};
use super::env_source::{EnvSource, EnvSourceConfig};
use super::error::{ConfigError, Result};
use super::file_source::{FileSource, FileSourceConfig};
use super::memory_source::{MemorySource, MemorySourceConfig};
use super::source::Source;
use super::type_options::TypeOptions;

// 构造函数类型
type Constructor = Box<dyn Fn(JsonValue) -> anyhow::Result<Box<dyn Source>> + Send + Sync>;

// 全局注册表，内置配置源在首次访问时注册
static REGISTRY: Lazy<RwLock<HashMap<String, Constructor>>> = Lazy::new(|| {
    let mut registry = HashMap::new();
    insert::<FileSource, FileSourceConfig>(&mut registry, "FileSource");
    insert::<EnvSource, EnvSourceConfig>(&mut registry, "EnvSource");
    insert::<MemorySource, MemorySourceConfig>(&mut registry, "MemorySource");
    registry.insert(
        "ApolloSource".to_string(),
        Box::new(|value| {
            let config: ApolloSourceConfig = from_options(value)?;
            Ok(Box::new(ApolloSource::new(config)?) as Box<dyn Source>)
        }),
    );
    RwLock::new(registry)
});

// 未填写 options 时按空对象处理，让配置类型使用默认值
fn from_options<C: DeserializeOwned>(value: JsonValue) -> anyhow::Result<C> {
    let value = match value {
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

fn constructor<T, Config>() -> Constructor
where
    T: Source + From<Config> + 'static,
    Config: DeserializeOwned + 'static,
{
    Box::new(|value| {
        let config: Config = from_options(value)?;
        Ok(Box::new(T::from(config)) as Box<dyn Source>)
    })
}

fn insert<T, Config>(registry: &mut HashMap<String, Constructor>, type_name: &str)
where
    T: Source + From<Config> + 'static,
    Config: DeserializeOwned + 'static,
{
    registry.insert(type_name.to_string(), constructor::<T, Config>());
}

/// 注册自定义配置源
///
/// 同名注册会覆盖之前的构造器（包括内置类型）。
///
/// # 示例
/// ```ignore
/// register_source::<ConsulSource, ConsulSourceConfig>("ConsulSource")?;
///
/// let source = create_source(&TypeOptions::from_json(r#"{
///     "type": "ConsulSource",
///     "options": { "address": "127.0.0.1:8500" }
/// }"#)?)?;
/// ```
pub fn register_source<T, Config>(type_name: &str) -> Result<()>
where
    T: Source + From<Config> + 'static,
    Config: DeserializeOwned + 'static,
{
    let mut registry = REGISTRY
        .write()
        .map_err(|_| ConfigError::Registry("failed to acquire write lock".to_string()))?;
    insert::<T, Config>(&mut registry, type_name);
    Ok(())
}

/// 根据 TypeOptions 创建配置源
///
/// 使用该类型名最近一次注册的构造器，`register_source` 覆盖过的内置类型
/// 同样按覆盖后的构造器创建。
pub fn create_source(type_options: &TypeOptions) -> Result<Box<dyn Source>> {
    let registry = REGISTRY
        .read()
        .map_err(|_| ConfigError::Registry("failed to acquire read lock".to_string()))?;

    let constructor = registry.get(&type_options.type_name).ok_or_else(|| {
        ConfigError::Registry(format!(
            "source type '{}' not registered",
            type_options.type_name
        ))
    })?;

    constructor(type_options.options.clone()).map_err(|e| {
        ConfigError::Registry(format!(
            "failed to create source '{}': {}",
            type_options.type_name, e
        ))
    })
}

/// 已注册的配置源类型名称，按字典序
pub fn registered_types() -> Vec<String> {
    let mut names: Vec<String> = match REGISTRY.read() {
        Ok(registry) => registry.keys().cloned().collect(),
        Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
    };
    names.sort();
    names
}
