//! 结构体绑定
//!
//! 把快照解码成强类型结构体。字段元数据由 `#[derive(Bind)]` 在编译期生成：
//! 每个字段声明来源 key 和可选的默认值字面量，嵌套结构体用同一个快照递归解码。
//!
//! 解码是全量的：所有字段都会被尝试，任何一个无法解析都会让整个绑定失败，
//! 错误中列出全部失败字段，而不是只报第一个。
//!
//! # 示例
//! ```
//! use dyncfg::cfg::{bind, Bind, Snapshot};
//!
//! #[derive(Debug, Bind)]
//! struct Database {
//!     #[bind(key = "DB_HOST", default = "localhost")]
//!     host: String,
//!     #[bind(key = "DB_MAX_OPEN")]
//!     max_open_conns: u32,
//! }
//!
//! #[derive(Debug, Bind)]
//! struct AppConfig {
//!     #[bind(key = "HTTP_PORT", default = "8080")]
//!     port: u16,
//!     #[bind(nested)]
//!     database: Database,
//! }
//!
//! let snapshot = Snapshot::from_iter([("DB_MAX_OPEN", "16")]);
//! let config: AppConfig = bind::decode(&snapshot).unwrap();
//! assert_eq!(config.port, 8080);
//! assert_eq!(config.database.max_open_conns, 16);
//!
//! let err = bind::decode::<AppConfig>(&Snapshot::empty()).unwrap_err();
//! assert_eq!(
//!     err.to_string(),
//!     r#"bind failed: database.max_open_conns: missing required key "DB_MAX_OPEN" and no default"#
//! );
//! ```

use std::fmt;
use thiserror::Error;

use super::parse_value::ParseValue;
use super::snapshot::Snapshot;

pub use dyncfg_macros::Bind;

/// 可从快照解码的类型
///
/// 通常由 `#[derive(Bind)]` 生成。手写实现时，应先对每个字段调用
/// `Decoder::field` / `Decoder::nested`，全部调用完成后再用 `?` 组装，
/// 这样所有失败都会被记录。
pub trait Bind: Sized {
    fn decode(decoder: &mut Decoder<'_>) -> Option<Self>;
}

/// 单个字段的失败原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldErrorKind {
    /// key 不存在且没有默认值
    Missing,
    /// key 存在但值无法解析
    Invalid { value: String, reason: String },
    /// 默认值字面量无法解析
    InvalidDefault { default: String, reason: String },
    /// 手写 `Bind` 实现没有给出值，也没有记录错误
    NoValue,
}

/// 单个字段的失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// 字段路径，如 `database.max_open_conns`
    pub path: String,
    /// 完整的来源 key（已拼接前缀）
    pub key: String,
    pub kind: FieldErrorKind,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FieldErrorKind::Missing => write!(
                f,
                "{}: missing required key {:?} and no default",
                self.path, self.key
            ),
            FieldErrorKind::Invalid { value, reason } => write!(
                f,
                "{}: invalid value {:?} for key {:?}: {}",
                self.path, value, self.key, reason
            ),
            FieldErrorKind::InvalidDefault { default, reason } => write!(
                f,
                "{}: invalid default {:?} for key {:?}: {}",
                self.path, default, self.key, reason
            ),
            FieldErrorKind::NoValue => write!(f, "{}: decoder produced no value", self.path),
        }
    }
}

/// 绑定失败，包含所有失败字段
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct BindError {
    pub fields: Vec<FieldError>,
}

impl BindError {
    pub fn paths(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.path.as_str()).collect()
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bind failed: ")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}

/// 解码上下文
///
/// 持有快照引用、当前字段路径、嵌套 key 前缀和累计的错误。
pub struct Decoder<'a> {
    snapshot: &'a Snapshot,
    path: Vec<&'static str>,
    prefix: String,
    errors: Vec<FieldError>,
}

impl<'a> Decoder<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self {
            snapshot,
            path: Vec::new(),
            prefix: String::new(),
            errors: Vec::new(),
        }
    }

    fn field_path(&self, name: &str) -> String {
        let mut path = self.path.join(".");
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(name);
        path
    }

    /// 解码一个标量字段
    ///
    /// 顺序：快照中的值 > 默认值 > `ParseValue::when_missing`，都没有则记录错误。
    pub fn field<T: ParseValue>(
        &mut self,
        name: &'static str,
        key: &str,
        default: Option<&str>,
    ) -> Option<T> {
        let full_key = format!("{}{}", self.prefix, key);

        let kind = if let Some(value) = self.snapshot.get(&full_key) {
            match T::parse_value(value) {
                Ok(v) => return Some(v),
                Err(e) => FieldErrorKind::Invalid {
                    value: value.to_string(),
                    reason: e.to_string(),
                },
            }
        } else if let Some(default) = default {
            match T::parse_value(default) {
                Ok(v) => return Some(v),
                Err(e) => FieldErrorKind::InvalidDefault {
                    default: default.to_string(),
                    reason: e.to_string(),
                },
            }
        } else if let Some(v) = T::when_missing() {
            return Some(v);
        } else {
            FieldErrorKind::Missing
        };

        self.errors.push(FieldError {
            path: self.field_path(name),
            key: full_key,
            kind,
        });
        None
    }

    /// 用同一个快照递归解码嵌套结构体，`prefix` 会拼接到其所有 key 前
    pub fn nested<T: Bind>(&mut self, name: &'static str, prefix: &str) -> Option<T> {
        let saved_len = self.prefix.len();
        self.prefix.push_str(prefix);
        self.path.push(name);
        let errors_before = self.errors.len();

        let value = T::decode(self);

        self.path.pop();
        self.prefix.truncate(saved_len);

        if value.is_none() && self.errors.len() == errors_before {
            self.errors.push(FieldError {
                path: self.field_path(name),
                key: self.prefix.clone(),
                kind: FieldErrorKind::NoValue,
            });
        }
        value
    }

    /// 结束解码，有任何字段失败都返回错误
    pub fn finish<T>(self, value: Option<T>) -> Result<T, BindError> {
        match value {
            Some(v) if self.errors.is_empty() => Ok(v),
            _ if !self.errors.is_empty() => Err(BindError {
                fields: self.errors,
            }),
            _ => Err(BindError {
                fields: vec![FieldError {
                    path: String::new(),
                    key: String::new(),
                    kind: FieldErrorKind::NoValue,
                }],
            }),
        }
    }
}

/// 把快照解码为 `T`
pub fn decode<T: Bind>(snapshot: &Snapshot) -> Result<T, BindError> {
    let mut decoder = Decoder::new(snapshot);
    let value = T::decode(&mut decoder);
    decoder.finish(value)
}
