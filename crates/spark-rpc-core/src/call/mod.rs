//! 调用引擎：一次 RPC 尝试的生命周期、批次提交与完成路由。
//!
//! # 教案式说明
//! - **意图（Why）**：应用以批次为单位提交非阻塞工作，引擎负责把批次送到共享的子通道传输上，
//!   并把结果以 `(tag, success)` 送回批次提交时所用的完成队列；
//! - **契约（What）**：
//!   - 状态机 `Created → AwaitingConnection → OpsInFlight → Completed`；
//!   - 每个被接受的非空批次恰好产生一次完成事件，失败以 `success=false` 表达，从不以 `Err` 返回；
//!   - 同一类操作同一时刻至多一个在途批次；一次性操作（发送/接收初始元数据、半关闭、接收状态）
//!     在整个调用内至多提交一次；
//!   - 取消使所有未结算批次各自以失败结算一次；
//!   - 同一提交线程的批次按提交顺序交给传输；多线程并发提交之间不保证相对顺序；
//! - **逻辑（How）**：
//!   1. 首个非空批次触发子通道查找/创建与连接，期间到达的批次按 FIFO 暂存；
//!   2. 传输就绪回调排空暂存队列后切换到 `OpsInFlight`，此后批次直接下发；
//!   3. 批次结算通过 [`BatchTicket`] 的原子闩锁在“传输完成”与“取消”之间只选出一个胜者；
//!   4. 每个批次的控制记录写入调用级 Arena，调用释放时 Arena 用量回灌给通道的尺寸估算器；
//! - **注意事项（Trade-offs）**：调用状态由一把短临界区互斥锁保护，向传输下发与向完成队列投递
//!   都在锁外进行，传输可以在 `send` 内同步完成批次而不会死锁。

mod completion;
mod op;

pub use completion::{BatchCompletion, BatchResult};
pub use op::{Metadata, Op, OpBatch, OpKind};

pub(crate) use completion::BatchTicket;

use completion::BatchControl;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::arena::Arena;
use crate::channel::ChannelCore;
use crate::completion_queue::CompletionQueue;
use crate::error::CallError;
use crate::status::{Status, StatusCode};
use crate::subchannel::SubchannelHandle;
use crate::transport::{Transport, TransportBatch};

/// 进程内唯一的调用编号。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CallId(u64);

impl CallId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CallId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// 调用生命周期阶段。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CallState {
    Created,
    AwaitingConnection,
    OpsInFlight,
    Completed,
}

struct Parked {
    ops: Vec<Op>,
    ticket: Arc<BatchTicket>,
}

struct CallBody {
    state: CallState,
    subchannel: Option<SubchannelHandle>,
    transport: Option<Arc<dyn Transport>>,
    busy: [bool; OpKind::COUNT],
    used_once: [bool; OpKind::COUNT],
    parked: VecDeque<Parked>,
    in_flight: Vec<Arc<BatchTicket>>,
    next_sequence: u64,
    initial_metadata: Option<Metadata>,
    message: Option<Bytes>,
    status: Option<Status>,
}

impl CallBody {
    fn new() -> Self {
        Self {
            state: CallState::Created,
            subchannel: None,
            transport: None,
            busy: [false; OpKind::COUNT],
            used_once: [false; OpKind::COUNT],
            parked: VecDeque::new(),
            in_flight: Vec::new(),
            next_sequence: 0,
            initial_metadata: None,
            message: None,
            status: None,
        }
    }

    fn validate(&self, id: CallId, ops: &[Op]) -> Result<(), CallError> {
        if self.state == CallState::Completed {
            return Err(CallError::AlreadyFinished { call_id: id.value() });
        }
        let mut seen = [false; OpKind::COUNT];
        for op in ops {
            let kind = op.kind();
            let slot = kind.slot();
            let once_only = !matches!(kind, OpKind::SendMessage | OpKind::RecvMessage);
            let closed_for_sends = kind == OpKind::SendMessage
                && self.used_once[OpKind::SendCloseFromClient.slot()];
            if seen[slot]
                || self.busy[slot]
                || (once_only && self.used_once[slot])
                || closed_for_sends
            {
                return Err(CallError::TooManyOperations {
                    call_id: id.value(),
                    kind,
                });
            }
            seen[slot] = true;
            if let Op::SendInitialMetadata(metadata) = op {
                if metadata.has_empty_key() {
                    return Err(CallError::EmptyMetadataKey);
                }
            }
        }
        Ok(())
    }

    fn reserve(&mut self, control: &BatchControl) {
        for kind in control.kinds() {
            self.busy[kind.slot()] = true;
            self.used_once[kind.slot()] = true;
        }
    }

    fn release(&mut self, ticket: &BatchTicket, control: &BatchControl) {
        for kind in control.kinds() {
            self.busy[kind.slot()] = false;
        }
        self.in_flight
            .retain(|entry| !std::ptr::eq(Arc::as_ptr(entry), ticket));
    }

    /// 取走所有未结算批次（停放的与在途的）。
    fn take_outstanding(&mut self) -> Vec<Arc<BatchTicket>> {
        self.busy = [false; OpKind::COUNT];
        std::mem::take(&mut self.parked)
            .into_iter()
            .map(|entry| entry.ticket)
            .chain(std::mem::take(&mut self.in_flight))
            .collect()
    }
}

pub(crate) struct CallShared {
    id: CallId,
    cq: CompletionQueue,
    arena: Arena,
    channel: Arc<ChannelCore>,
    body: Mutex<CallBody>,
}

/// 一次 RPC 尝试。
///
/// 由 [`Channel::create_call`](crate::Channel::create_call) 创建；句柄在调用完成前被丢弃时调用被取消。
/// 在途批次持有调用的内部状态，直到各自结算。
pub struct Call {
    shared: Arc<CallShared>,
}

impl Call {
    pub(crate) fn new(cq: CompletionQueue, channel: Arc<ChannelCore>) -> Self {
        let arena = Arena::new(channel.estimator().estimate());
        let id = CallId::next();
        trace!(%id, cq = cq.id(), "call created");
        Self {
            shared: Arc::new(CallShared {
                id,
                cq,
                arena,
                channel,
                body: Mutex::new(CallBody::new()),
            }),
        }
    }

    pub fn id(&self) -> CallId {
        self.shared.id
    }

    pub fn state(&self) -> CallState {
        self.shared.body.lock().state
    }

    /// 绑定的完成队列。
    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.shared.cq
    }

    /// 提交批次。
    ///
    /// 校验失败返回 [`CallError`] 且不产生完成事件；接受后恰好产生一次完成事件。
    ///
    /// # Panics
    /// 完成队列已关闭时提交属于编程错误。
    pub fn submit(&self, batch: OpBatch) -> Result<(), CallError> {
        self.shared.submit(batch)
    }

    /// 以 `Cancelled` 状态取消调用；调用已完成时返回 `false`。
    pub fn cancel(&self) -> bool {
        self.shared.terminate(Status::cancelled(), true)
    }

    /// 以指定状态取消调用。
    pub fn cancel_with_status(&self, status: Status) -> bool {
        self.shared.terminate(status, true)
    }

    /// 调用绑定的子通道（首个批次提交之后可用）。
    pub fn subchannel(&self) -> Option<SubchannelHandle> {
        self.shared.body.lock().subchannel.clone()
    }

    /// 取走对端初始元数据。
    pub fn take_initial_metadata(&self) -> Option<Metadata> {
        self.shared.body.lock().initial_metadata.take()
    }

    /// 取走最近一次 `RecvMessage` 收到的消息。
    pub fn take_message(&self) -> Option<Bytes> {
        self.shared.body.lock().message.take()
    }

    /// 调用的最终状态（终止批次完成或取消之后可用）。
    pub fn final_status(&self) -> Option<Status> {
        self.shared.body.lock().status.clone()
    }

    /// 调用级 Arena 当前用量。
    pub fn arena_used(&self) -> usize {
        self.shared.arena.total_used()
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if self.state() != CallState::Completed {
            self.shared.terminate(Status::cancelled(), true);
        }
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl CallShared {
    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    fn submit(self: &Arc<Self>, batch: OpBatch) -> Result<(), CallError> {
        let (tag, ops) = batch.into_parts();
        let mut body = self.body.lock();
        body.validate(self.id, &ops)?;
        self.cq.begin_op(tag);

        if ops.is_empty() {
            drop(body);
            self.cq.end_op(tag, true);
            return Ok(());
        }

        let kinds: Vec<OpKind> = ops.iter().map(Op::kind).collect();
        let slot = self
            .arena
            .alloc_slot(BatchControl::new(body.next_sequence, &kinds));
        body.next_sequence += 1;
        let ticket = Arc::new(BatchTicket::new(tag, slot));
        let control = self.arena.get(slot);
        body.reserve(control);
        trace!(
            call_id = %self.id,
            %tag,
            sequence = control.sequence,
            ops = control.op_count,
            state = ?body.state,
            "batch accepted"
        );

        match body.state {
            CallState::Created => {
                body.state = CallState::AwaitingConnection;
                body.parked.push_back(Parked { ops, ticket });
                drop(body);
                self.connect();
            }
            CallState::AwaitingConnection => {
                body.parked.push_back(Parked { ops, ticket });
            }
            CallState::OpsInFlight => {
                let Some(transport) = body.transport.clone() else {
                    unreachable!("ops in flight without a transport");
                };
                body.in_flight.push(Arc::clone(&ticket));
                drop(body);
                self.dispatch(&transport, ops, ticket);
            }
            CallState::Completed => unreachable!("validated above"),
        }
        Ok(())
    }

    fn connect(self: &Arc<Self>) {
        let subchannel = self.channel.subchannel();
        let attempt = subchannel.transport();
        let cancelled_while_connecting = {
            let mut body = self.body.lock();
            body.subchannel = Some(subchannel);
            let cancelled = body.state == CallState::Completed;
            if let (Ok(transport), false) = (&attempt, cancelled) {
                body.transport = Some(Arc::clone(transport));
            }
            cancelled
        };
        if cancelled_while_connecting {
            // 取消先于传输到达，由这里通知传输。
            if let Ok(transport) = &attempt {
                debug!(call_id = %self.id, "call cancelled while connecting");
                transport.cancel(self.id);
            }
            return;
        }
        match attempt {
            Ok(transport) if transport.is_closed() => {
                warn!(call_id = %self.id, "call obtained a closed transport");
                self.terminate(
                    Status::new(StatusCode::Unavailable, "transport closed before the call started"),
                    false,
                );
            }
            Ok(transport) => {
                if transport.is_ready() {
                    self.flush_parked();
                } else {
                    let weak = Arc::downgrade(self);
                    transport.on_ready(Box::new(move || {
                        if let Some(call) = weak.upgrade() {
                            call.flush_parked();
                        }
                    }));
                }
            }
            Err(err) => {
                warn!(call_id = %self.id, code = err.code(), "call failed to obtain a transport");
                self.terminate(Status::new(StatusCode::Unavailable, err.to_string()), false);
            }
        }
    }

    fn flush_parked(self: &Arc<Self>) {
        loop {
            let mut body = self.body.lock();
            if body.state != CallState::AwaitingConnection {
                return;
            }
            let Some(transport) = body.transport.clone() else {
                return;
            };
            let Some(parked) = body.parked.pop_front() else {
                body.state = CallState::OpsInFlight;
                debug!(call_id = %self.id, "transport ready; call ops in flight");
                return;
            };
            body.in_flight.push(Arc::clone(&parked.ticket));
            drop(body);
            self.dispatch(&transport, parked.ops, parked.ticket);
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        ops: Vec<Op>,
        ticket: Arc<BatchTicket>,
    ) {
        let completion = BatchCompletion::new(Arc::clone(self), ticket);
        transport.send(TransportBatch::new(self.id, ops, completion));
    }

    pub(crate) fn finish_batch(&self, ticket: &BatchTicket, result: BatchResult) {
        if !ticket.settle() {
            trace!(call_id = %self.id, tag = %ticket.tag(), "batch already settled by cancellation");
            return;
        }
        let control = self.arena.get(ticket.control());
        let (success, initial_metadata, message, status) = result.into_parts();
        let (outstanding, transport) = {
            let mut body = self.body.lock();
            body.release(ticket, control);
            if success {
                if control.contains(OpKind::RecvInitialMetadata) {
                    body.initial_metadata = initial_metadata;
                }
                if control.contains(OpKind::RecvMessage) {
                    body.message = message;
                }
            }
            if control.is_terminal() && body.state != CallState::Completed {
                let status = match (success, status) {
                    (true, Some(status)) => status,
                    (true, None) => {
                        Status::new(StatusCode::Unknown, "transport completed without a status")
                    }
                    (false, _) => {
                        Status::new(StatusCode::Unavailable, "transport failed the call")
                    }
                };
                debug!(call_id = %self.id, status = %status, "call completed");
                body.status = Some(status);
                body.state = CallState::Completed;
                (body.take_outstanding(), body.transport.clone())
            } else {
                (Vec::new(), None)
            }
        };
        self.cq.end_op(ticket.tag(), success);
        if !outstanding.is_empty() {
            // 状态已到达，其余批次再也等不到结果。
            debug!(
                call_id = %self.id,
                outstanding = outstanding.len(),
                "failing batches outstanding at call completion"
            );
            self.fail_tickets(outstanding);
            if let Some(transport) = transport {
                transport.cancel(self.id);
            }
        }
    }

    fn fail_tickets(&self, tickets: Vec<Arc<BatchTicket>>) {
        for ticket in tickets {
            if ticket.settle() {
                self.cq.end_op(ticket.tag(), false);
            }
        }
    }

    /// 结束调用并以失败结算所有未结算批次；调用已完成时返回 `false`。
    fn terminate(&self, status: Status, notify_transport: bool) -> bool {
        let (outstanding, transport) = {
            let mut body = self.body.lock();
            if body.state == CallState::Completed {
                return false;
            }
            body.state = CallState::Completed;
            body.status = Some(status);
            (body.take_outstanding(), body.transport.clone())
        };
        debug!(
            call_id = %self.id,
            outstanding = outstanding.len(),
            "call terminated"
        );
        self.fail_tickets(outstanding);
        if notify_transport {
            if let Some(transport) = transport {
                transport.cancel(self.id);
            }
        }
        true
    }
}

impl Drop for CallShared {
    fn drop(&mut self) {
        let used = self.arena.total_used();
        self.channel.estimator().update(used);
        trace!(call_id = %self.id, arena_bytes = used, "call released");
    }
}
