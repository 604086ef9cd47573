use std::time::Duration;
use thiserror::Error;

use super::duration::parse_duration;

/// 字符串值解析失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

/// 从字符串解析配置值的 trait
///
/// 绑定时每个标量字段都通过它完成 `String -> T` 的转换，默认值字面量
/// 也走同一条路径。未实现此 trait 的字段类型无法通过编译。
pub trait ParseValue: Sized {
    /// 从字符串解析值
    fn parse_value(s: &str) -> Result<Self, ParseError>;

    /// key 不存在且没有默认值时的取值
    ///
    /// 返回 `None` 表示字段必填；`Option<T>` 返回 `Some(None)`。
    fn when_missing() -> Option<Self> {
        None
    }
}

impl ParseValue for String {
    fn parse_value(s: &str) -> Result<Self, ParseError> {
        Ok(s.to_string())
    }
}

macro_rules! impl_parse_value_numeric {
    ($($ty:ty),*) => {
        $(
            impl ParseValue for $ty {
                fn parse_value(s: &str) -> Result<Self, ParseError> {
                    s.trim().parse().map_err(|e| ParseError(
                        format!("cannot parse {:?} as {}: {}", s, stringify!($ty), e)
                    ))
                }
            }
        )*
    };
}

impl_parse_value_numeric!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

// 与 Go strconv.ParseBool 接受的写法一致
impl ParseValue for bool {
    fn parse_value(s: &str) -> Result<Self, ParseError> {
        match s.trim() {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
            _ => Err(ParseError(format!("cannot parse {:?} as bool", s))),
        }
    }
}

impl ParseValue for Duration {
    fn parse_value(s: &str) -> Result<Self, ParseError> {
        parse_duration(s).map_err(|e| ParseError(format!("cannot parse {:?} as duration: {}", s, e)))
    }
}

impl<T: ParseValue> ParseValue for Option<T> {
    fn parse_value(s: &str) -> Result<Self, ParseError> {
        T::parse_value(s).map(Some)
    }

    fn when_missing() -> Option<Self> {
        Some(None)
    }
}
