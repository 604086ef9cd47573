//! 配置快照
//!
//! 不可变的 `key -> value` 视图，所有配置值都是字符串

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// 配置快照
///
/// 构造后不可修改，克隆只增加引用计数。缺失的 key 表示“未设置”，
/// 不会用空字符串占位。
///
/// # 示例
/// ```
/// use dyncfg::cfg::Snapshot;
///
/// let env = Snapshot::from_iter([("FOO", "1")]);
/// let map = Snapshot::from_iter([("FOO", "2"), ("BAR", "3")]);
///
/// let merged = Snapshot::merge([&env, &map]);
/// assert_eq!(merged.get("FOO"), Some("2"));
/// assert_eq!(merged.get("BAR"), Some("3"));
/// ```
#[derive(Clone, Default)]
pub struct Snapshot(Arc<BTreeMap<String, String>>);

impl Snapshot {
    /// 空快照
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_arc(entries: Arc<BTreeMap<String, String>>) -> Self {
        Self(entries)
    }

    pub(crate) fn as_arc(&self) -> &Arc<BTreeMap<String, String>> {
        &self.0
    }

    /// 读取单个 key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 按 key 的字典序遍历
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// 复制出一份可修改的 map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0.as_ref().clone()
    }

    /// 从左到右逐层覆盖合并
    ///
    /// 第一个快照优先级最低，最后一个最高。
    pub fn merge<'a, I>(layers: I) -> Snapshot
    where
        I: IntoIterator<Item = &'a Snapshot>,
    {
        let mut merged = BTreeMap::new();
        for layer in layers {
            for (key, value) in layer.0.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        Self(Arc::new(merged))
    }

    /// 两个快照是否指向同一份数据
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for Snapshot {}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for Snapshot
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(Arc::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }
}

impl From<BTreeMap<String, String>> for Snapshot {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self(Arc::new(entries))
    }
}

impl From<HashMap<String, String>> for Snapshot {
    fn from(entries: HashMap<String, String>) -> Self {
        entries.into_iter().collect()
    }
}
