use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::op::{Metadata, OpKind};
use super::{CallId, CallShared};
use crate::arena::ArenaSlot;
use crate::completion_queue::Tag;
use crate::status::Status;
use crate::sync::{AtomicBool, Ordering};

/// 写入调用级 Arena 的批次控制记录。
#[derive(Clone, Copy, Debug)]
pub(crate) struct BatchControl {
    pub(crate) sequence: u64,
    pub(crate) op_count: u32,
    kinds: u8,
}

impl BatchControl {
    pub(crate) fn new(sequence: u64, kinds: &[OpKind]) -> Self {
        Self {
            sequence,
            op_count: kinds.len() as u32,
            kinds: kinds
                .iter()
                .fold(0u8, |mask, kind| mask | (1 << kind.slot())),
        }
    }

    pub(crate) fn contains(&self, kind: OpKind) -> bool {
        self.kinds & (1 << kind.slot()) != 0
    }

    pub(crate) fn kinds(&self) -> impl Iterator<Item = OpKind> + '_ {
        OpKind::ALL.into_iter().filter(|kind| self.contains(*kind))
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.contains(OpKind::RecvStatusOnClient)
    }
}

/// 批次的“恰好一次结算”闩锁。
///
/// 传输完成与调用取消可能并发到达，二者都先尝试 [`BatchTicket::settle`]，只有胜者投递完成事件。
/// 批次的操作构成留在 Arena 里，经 [`BatchTicket::control`] 由所属调用读取。
pub(crate) struct BatchTicket {
    tag: Tag,
    control: ArenaSlot<BatchControl>,
    settled: AtomicBool,
}

impl BatchTicket {
    pub(crate) fn new(tag: Tag, control: ArenaSlot<BatchControl>) -> Self {
        Self {
            tag,
            control,
            settled: AtomicBool::new(false),
        }
    }

    pub(crate) fn tag(&self) -> Tag {
        self.tag
    }

    pub(crate) fn control(&self) -> ArenaSlot<BatchControl> {
        self.control
    }

    /// 首次结算返回 `true`。
    pub(crate) fn settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// 传输回报给引擎的批次结果。
///
/// 成功时携带接收类操作的产出：对端初始元数据、一条消息（`None` 表示对端已结束消息流）、
/// 最终状态。失败时产出被忽略。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BatchResult {
    success: bool,
    initial_metadata: Option<Metadata>,
    message: Option<Bytes>,
    status: Option<Status>,
}

impl BatchResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure() -> Self {
        Self::default()
    }

    pub fn with_initial_metadata(mut self, metadata: Metadata) -> Self {
        self.initial_metadata = Some(metadata);
        self
    }

    pub fn with_message(mut self, message: impl Into<Bytes>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub(crate) fn into_parts(self) -> (bool, Option<Metadata>, Option<Bytes>, Option<Status>) {
        (
            self.success,
            self.initial_metadata,
            self.message,
            self.status,
        )
    }
}

/// 批次完成句柄。
///
/// # 契约说明（What）
/// - [`BatchCompletion::complete`] 消费句柄，因此同一批次无法被传输完成两次；
/// - 句柄未完成即被丢弃时，批次以失败结算；
/// - 调用已被取消时完成是空操作，取消路径已经投递过失败事件。
pub struct BatchCompletion {
    call: Option<Arc<CallShared>>,
    ticket: Arc<BatchTicket>,
}

impl BatchCompletion {
    pub(crate) fn new(call: Arc<CallShared>, ticket: Arc<BatchTicket>) -> Self {
        Self {
            call: Some(call),
            ticket,
        }
    }

    pub fn tag(&self) -> Tag {
        self.ticket.tag()
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call.as_ref().map(|call| call.id())
    }

    /// 批次是否已被取消路径结算。
    pub fn is_cancelled(&self) -> bool {
        self.ticket.is_settled()
    }

    pub fn complete(mut self, result: BatchResult) {
        if let Some(call) = self.call.take() {
            call.finish_batch(&self.ticket, result);
        }
    }
}

impl Drop for BatchCompletion {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            call.finish_batch(&self.ticket, BatchResult::failure());
        }
    }
}

impl fmt::Debug for BatchCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCompletion")
            .field("tag", &self.ticket.tag())
            .field("settled", &self.ticket.is_settled())
            .finish()
    }
}
