//! 调用引擎消费的外部能力：传输连接、连接器与鉴权信号。
//!
//! ## 角色定位（Why）
//! - 帧编解码、TLS 握手、I/O 轮询全部位于 [`Transport`] 之后，引擎只关心“发送批次、最终回调完成”；
//! - [`Connector`] 把子通道键变成传输实例，[`Authorizer`] 在子通道创建时给出一次性鉴权结论。
//!
//! ## 契约（What）
//! - `Transport::send` 接管 [`TransportBatch`] 的所有权，且必须最终对其中的
//!   [`BatchCompletion`] 调用一次 `complete`；直接丢弃等价于以失败完成；
//! - `Transport::on_ready` 的回调恰好执行一次：传输已就绪或已关闭时可以在调用线程内立即执行；
//! - 实现不得在持有自身锁时调用 `complete` 或就绪回调，二者都可能重入 `send`。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::call::{BatchCompletion, CallId, Op, OpKind};
use crate::completion_queue::Tag;
use crate::error::ConnectError;
use crate::subchannel::key::SubchannelKey;

/// 传输就绪回调。
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// 传输连接能力。
pub trait Transport: Send + Sync {
    /// 提交一个批次；完成时通过批次携带的 [`BatchCompletion`] 回报。
    fn send(&self, batch: TransportBatch);

    /// 当前是否可以接收批次。
    fn is_ready(&self) -> bool;

    /// 在传输就绪时执行一次 `callback`。
    ///
    /// 已关闭的传输必须立即执行回调，之后到达的 `send` 以失败完成。
    fn on_ready(&self, callback: ReadyCallback);

    /// 传输是否已永久关闭；子通道据此丢弃它并重新建连。默认永不关闭。
    fn is_closed(&self) -> bool {
        false
    }

    /// 调用被取消时的通知，默认忽略。
    fn cancel(&self, call: CallId) {
        let _ = call;
    }
}

/// 连接器：为子通道键建立传输。
pub trait Connector: Send + Sync {
    /// 同步建立连接，`timeout` 为本次尝试至少可用的时间窗口。
    fn connect(
        &self,
        key: &SubchannelKey,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ConnectError>;
}

/// 鉴权信号，每个子通道创建时消费一次。
pub trait Authorizer: Send + Sync {
    fn authorize(&self, key: &SubchannelKey) -> bool;
}

/// 无条件放行。
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _key: &SubchannelKey) -> bool {
        true
    }
}

/// 交给传输的批次：调用编号、操作序列与完成句柄。
pub struct TransportBatch {
    call_id: CallId,
    ops: Vec<Op>,
    completion: BatchCompletion,
}

impl TransportBatch {
    pub(crate) fn new(call_id: CallId, ops: Vec<Op>, completion: BatchCompletion) -> Self {
        Self {
            call_id,
            ops,
            completion,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn tag(&self) -> Tag {
        self.completion.tag()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// 批次是否包含某类操作。
    pub fn contains(&self, kind: OpKind) -> bool {
        self.ops.iter().any(|op| op.kind() == kind)
    }

    /// 拆分为操作序列与完成句柄。
    pub fn into_parts(self) -> (Vec<Op>, BatchCompletion) {
        (self.ops, self.completion)
    }
}

impl fmt::Debug for TransportBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBatch")
            .field("call_id", &self.call_id)
            .field("tag", &self.tag())
            .field(
                "ops",
                &self.ops.iter().map(Op::kind).collect::<Vec<_>>(),
            )
            .finish()
    }
}
