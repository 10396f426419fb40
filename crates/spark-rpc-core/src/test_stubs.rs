//! 测试替身：手动驱动的传输、连接器与鉴权信号。
//!
//! # 设计初衷（Why）
//! - 单元测试、集成测试与基准需要在不引入真实网络的前提下精确控制“何时就绪”“何时完成”
//!   “连接是否失败”；
//! - 这些替身以公开模块暴露，下游传输实现的测试也可以直接复用。
//!
//! # 使用契约（What）
//! - [`ManualTransport`] 记录收到的批次，直到测试显式完成它们或关闭传输；
//! - [`ManualConnector`] 每次连接创建一个新的 [`ManualTransport`]，可预置失败或“未就绪”状态；
//! - 替身在调用完成回调前总是先释放自身锁，允许回调重入。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::call::{BatchResult, CallId};
use crate::completion_queue::Tag;
use crate::error::ConnectError;
use crate::subchannel::key::SubchannelKey;
use crate::transport::{Authorizer, Connector, ReadyCallback, Transport, TransportBatch};

/// 永远拒绝的鉴权信号。
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, _key: &SubchannelKey) -> bool {
        false
    }
}

/// 手动驱动的传输。
#[derive(Default)]
pub struct ManualTransport {
    state: Mutex<TransportState>,
}

#[derive(Default)]
struct TransportState {
    ready: bool,
    closed: bool,
    waiters: Vec<ReadyCallback>,
    pending: VecDeque<TransportBatch>,
    sent: Vec<Tag>,
    cancelled: Vec<CallId>,
}

impl ManualTransport {
    pub fn new(ready: bool) -> Self {
        Self {
            state: Mutex::new(TransportState {
                ready,
                ..TransportState::default()
            }),
        }
    }

    /// 尚未完成的批次数量。
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 按到达顺序记录的批次 tag。
    pub fn sent_tags(&self) -> Vec<Tag> {
        self.state.lock().sent.clone()
    }

    /// 收到取消通知的调用。
    pub fn cancelled_calls(&self) -> Vec<CallId> {
        self.state.lock().cancelled.clone()
    }

    /// 切换为就绪并执行所有等待中的回调。
    pub fn set_ready(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.ready = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// 关闭传输：待决批次与等待中的就绪回调全部释放，此后的批次立即失败。
    pub fn close(&self) {
        let (waiters, batches) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.ready = false;
            (
                std::mem::take(&mut state.waiters),
                state.pending.drain(..).collect::<Vec<_>>(),
            )
        };
        for waiter in waiters {
            waiter();
        }
        for batch in batches {
            let (_, completion) = batch.into_parts();
            completion.complete(BatchResult::failure());
        }
    }

    /// 以 `result` 完成最早到达的批次。
    pub fn complete_next(&self, result: BatchResult) -> Option<Tag> {
        let batch = self.state.lock().pending.pop_front()?;
        let tag = batch.tag();
        let (_, completion) = batch.into_parts();
        completion.complete(result);
        Some(tag)
    }

    /// 以统一结果完成全部待决批次。
    pub fn complete_all(&self, success: bool) -> usize {
        let batches: Vec<_> = self.state.lock().pending.drain(..).collect();
        let count = batches.len();
        for batch in batches {
            let (_, completion) = batch.into_parts();
            completion.complete(if success {
                BatchResult::success()
            } else {
                BatchResult::failure()
            });
        }
        count
    }

    /// 取走全部待决批次，由测试自行完成或丢弃。
    pub fn take_batches(&self) -> Vec<TransportBatch> {
        self.state.lock().pending.drain(..).collect()
    }
}

impl Transport for ManualTransport {
    fn send(&self, batch: TransportBatch) {
        let mut state = self.state.lock();
        state.sent.push(batch.tag());
        if state.closed {
            drop(state);
            let (_, completion) = batch.into_parts();
            completion.complete(BatchResult::failure());
            return;
        }
        state.pending.push_back(batch);
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn on_ready(&self, callback: ReadyCallback) {
        let mut state = self.state.lock();
        if state.ready || state.closed {
            drop(state);
            callback();
        } else {
            state.waiters.push(callback);
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn cancel(&self, call: CallId) {
        self.state.lock().cancelled.push(call);
    }
}

/// 手动驱动的连接器。
#[derive(Default)]
pub struct ManualConnector {
    state: Mutex<ConnectorState>,
}

#[derive(Default)]
struct ConnectorState {
    attempts: usize,
    start_unready: bool,
    failures: VecDeque<ConnectError>,
    transports: Vec<Arc<ManualTransport>>,
    during_connect: Option<Box<dyn FnOnce() + Send>>,
}

impl ManualConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让下一次连接尝试以 `err` 失败。
    pub fn fail_next(&self, err: ConnectError) {
        self.state.lock().failures.push_back(err);
    }

    /// 此后创建的传输以“未就绪”状态开始。
    pub fn start_unready(&self) {
        self.state.lock().start_unready = true;
    }

    /// 在下一次连接尝试进行期间（传输交还给调用方之前）执行 `hook`。
    pub fn during_next_connect(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().during_connect = Some(Box::new(hook));
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// 最近一次成功创建的传输。
    pub fn last_transport(&self) -> Option<Arc<ManualTransport>> {
        self.state.lock().transports.last().cloned()
    }
}

impl Connector for ManualConnector {
    fn connect(
        &self,
        _key: &SubchannelKey,
        _timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        let (transport, hook) = {
            let mut state = self.state.lock();
            state.attempts += 1;
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
            let transport = Arc::new(ManualTransport::new(!state.start_unready));
            state.transports.push(Arc::clone(&transport));
            (transport, state.during_connect.take())
        };
        if let Some(hook) = hook {
            hook();
        }
        Ok(transport)
    }
}
