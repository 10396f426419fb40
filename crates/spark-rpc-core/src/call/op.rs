use bytes::Bytes;

use crate::completion_queue::Tag;

/// 操作类别；每类占用调用上的一个槽位。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum OpKind {
    SendInitialMetadata,
    SendMessage,
    SendCloseFromClient,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
}

impl OpKind {
    /// 槽位数量。
    pub const COUNT: usize = 6;

    pub const ALL: [OpKind; OpKind::COUNT] = [
        OpKind::SendInitialMetadata,
        OpKind::SendMessage,
        OpKind::SendCloseFromClient,
        OpKind::RecvInitialMetadata,
        OpKind::RecvMessage,
        OpKind::RecvStatusOnClient,
    ];

    pub const fn slot(self) -> usize {
        self as usize
    }

    /// 携带最终状态的终止操作。
    pub const fn is_terminal(self) -> bool {
        matches!(self, OpKind::RecvStatusOnClient)
    }
}

/// 有序的元数据键值对；同名键允许重复，保持插入顺序。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, Bytes)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.push(key, value);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((key.into(), value.into()));
    }

    /// 返回第一个同名键的值。
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 键和值的总字节数。
    pub fn byte_len(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub(crate) fn has_empty_key(&self) -> bool {
        self.entries.iter().any(|(k, _)| k.is_empty())
    }
}

/// 单个操作。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Op {
    SendInitialMetadata(Metadata),
    SendMessage(Bytes),
    SendCloseFromClient,
    RecvInitialMetadata,
    RecvMessage,
    RecvStatusOnClient,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::SendInitialMetadata(_) => OpKind::SendInitialMetadata,
            Op::SendMessage(_) => OpKind::SendMessage,
            Op::SendCloseFromClient => OpKind::SendCloseFromClient,
            Op::RecvInitialMetadata => OpKind::RecvInitialMetadata,
            Op::RecvMessage => OpKind::RecvMessage,
            Op::RecvStatusOnClient => OpKind::RecvStatusOnClient,
        }
    }
}

/// 应用提交的批次：一组操作 + 一个关联令牌。
///
/// 提交后批次被引擎接管，不再可变。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpBatch {
    tag: Tag,
    ops: Vec<Op>,
}

impl OpBatch {
    pub fn new(tag: impl Into<Tag>) -> Self {
        Self {
            tag: tag.into(),
            ops: Vec::new(),
        }
    }

    pub fn push(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }

    pub fn send_initial_metadata(self, metadata: Metadata) -> Self {
        self.push(Op::SendInitialMetadata(metadata))
    }

    pub fn send_message(self, message: impl Into<Bytes>) -> Self {
        self.push(Op::SendMessage(message.into()))
    }

    pub fn send_close_from_client(self) -> Self {
        self.push(Op::SendCloseFromClient)
    }

    pub fn recv_initial_metadata(self) -> Self {
        self.push(Op::RecvInitialMetadata)
    }

    pub fn recv_message(self) -> Self {
        self.push(Op::RecvMessage)
    }

    pub fn recv_status_on_client(self) -> Self {
        self.push(Op::RecvStatusOnClient)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Tag, Vec<Op>) {
        (self.tag, self.ops)
    }
}
