use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 连接参数取值。
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ArgValue {
    Int(i64),
    Str(String),
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

/// 归一化后的连接参数集合。
///
/// 以有序映射存储，插入顺序不同但内容相同的两组参数比较结果相等；同名参数后写覆盖先写。
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChannelArgs {
    entries: BTreeMap<String, ArgValue>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式设置一个参数。
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 子通道去重键：远端地址字节 + 归一化连接参数。
///
/// # 契约说明（What）
/// - 相等与排序均为结构化比较：先按字节序比较地址，再比较参数集合；
/// - 地址以 `Arc<[u8]>` 持有，键在索引快照之间复制时只增加引用计数。
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SubchannelKey {
    address: Arc<[u8]>,
    args: ChannelArgs,
}

impl SubchannelKey {
    pub fn new(address: impl AsRef<[u8]>, args: ChannelArgs) -> Self {
        Self {
            address: Arc::from(address.as_ref()),
            args,
        }
    }

    pub fn address(&self) -> &[u8] {
        &self.address
    }

    pub fn args(&self) -> &ChannelArgs {
        &self.args
    }

    /// 地址的可读形式，非 UTF-8 字节以替换字符呈现。
    pub fn address_lossy(&self) -> String {
        String::from_utf8_lossy(&self.address).into_owned()
    }
}

impl fmt::Debug for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubchannelKey")
            .field("address", &self.address_lossy())
            .field("args", &self.args)
            .finish()
    }
}

impl fmt::Display for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address_lossy())
    }
}
