// TypeOptions 序列化相关实现

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 类型选项：`type` 选择注册表中的构造器，`options` 交给构造器反序列化
///
/// # 示例
/// ```
/// use dyncfg::cfg::TypeOptions;
///
/// let opts = TypeOptions::from_yaml(r#"
/// type: EnvSource
/// options:
///   prefix: APP_
/// "#).unwrap();
///
/// assert_eq!(opts.type_name, "EnvSource");
/// assert_eq!(opts.options["prefix"], "APP_");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeOptions {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub options: JsonValue,
}

impl TypeOptions {
    pub fn new(type_name: impl Into<String>, options: JsonValue) -> Self {
        Self {
            type_name: type_name.into(),
            options,
        }
    }

    /// 从 JSON 字符串创建（支持 JSON5：注释、尾随逗号、未引用的键）
    pub fn from_json(json_str: &str) -> Result<Self> {
        Ok(json5::from_str(json_str)?)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml_str)?)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
