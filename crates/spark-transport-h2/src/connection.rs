//! 回环连接：在内存中扮演回显对端的传输实现。
//!
//! # 教案式说明
//! - **意图（Why）**：在没有真实套接字与帧编解码的前提下，让调用引擎跑通“准入 → 发送 → 接收 →
//!   终止”的完整链路，同时真实地驱动连接级的准入策略与头部热度计数；
//! - **契约（What）**：
//!   - 发送的初始元数据被回显为接收的初始元数据，发送的消息按序交给后续 `RecvMessage`；
//!   - 客户端半关闭后，`RecvMessage` 以“无消息”成功完成，`RecvStatusOnClient` 以 `Ok` 完成并释放流；
//!   - 超出通告上限的新流等待准入；被取消的流扣一分，直到设置轮次确认；
//!   - 暂时无法满足的批次按 FIFO 停放，每次流状态变化后重试；流结束时同一调用仍停放的批次以失败完成；
//!   - 连接关闭时停放批次全部以失败完成，握手等待者被唤醒，子通道据 `is_closed` 重连；
//! - **逻辑（How）**：单把互斥锁保护全部连接状态，`pump` 反复扫描停放队列直到一轮内没有进展，
//!   收集到的完成在释放锁之后统一执行（启用 `runtime-tokio` 且配置了运行时句柄时改为投递到运行时）。
//! - **注意事项（Trade-offs）**：扫描是 `O(停放批次数)` 的，适合测试与演示规模。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_rpc_core::{
    BatchCompletion, BatchResult, CallId, ConnectError, Connector, Metadata, Op, OpKind,
    ReadyCallback, Status, SubchannelKey, Transport, TransportBatch,
};
use tracing::{debug, trace};

use crate::header_table::HeaderIndexer;
use crate::settings::{H2Settings, SettingsTracker};

/// 头部热度槽位数。
const HEADER_SLOTS: usize = 64;

/// 回环连接的累计统计。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoopbackStats {
    /// 获得准入的流数量。
    pub admitted_streams: u64,
    /// 因取消而扣分的流数量。
    pub reset_streams: u64,
    /// 进入动态表的头部数量。
    pub indexed_headers: u64,
    /// 以字面量发送的头部数量。
    pub literal_headers: u64,
}

/// 回环连接。
pub struct LoopbackConnection {
    state: Mutex<ConnectionState>,
    #[cfg(feature = "runtime-tokio")]
    runtime: Option<tokio::runtime::Handle>,
}

struct ConnectionState {
    ready: bool,
    closed: bool,
    waiters: Vec<ReadyCallback>,
    settings: SettingsTracker,
    headers: HeaderIndexer<HEADER_SLOTS>,
    streams: HashMap<CallId, Stream>,
    parked: VecDeque<Parked>,
    stats: LoopbackStats,
}

#[derive(Default)]
struct Stream {
    echo_metadata: Option<Metadata>,
    inbox: VecDeque<Bytes>,
    half_closed: bool,
}

struct Parked {
    call_id: CallId,
    /// 尚未获得准入时保留的待应用发送操作。
    sends: Option<Vec<Op>>,
    receives: Vec<OpKind>,
    completion: BatchCompletion,
}

type Settled = (BatchCompletion, BatchResult);

impl LoopbackConnection {
    /// 创建已就绪的连接。
    pub fn new(settings: &H2Settings) -> Self {
        Self::build(settings, true)
    }

    /// 创建尚未完成握手的连接，调用 [`LoopbackConnection::complete_handshake`] 后就绪。
    pub fn handshaking(settings: &H2Settings) -> Self {
        Self::build(settings, false)
    }

    fn build(settings: &H2Settings, ready: bool) -> Self {
        Self {
            state: Mutex::new(ConnectionState {
                ready,
                closed: false,
                waiters: Vec::new(),
                settings: SettingsTracker::new(settings),
                headers: HeaderIndexer::new(settings),
                streams: HashMap::new(),
                parked: VecDeque::new(),
                stats: LoopbackStats::default(),
            }),
            #[cfg(feature = "runtime-tokio")]
            runtime: None,
        }
    }

    /// 把完成回调投递到 `handle` 所属的运行时执行。
    #[cfg(feature = "runtime-tokio")]
    pub fn with_runtime(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// 握手完成：切换为就绪并执行等待中的就绪回调。
    pub fn complete_handshake(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.ready = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    /// 准备写出设置帧：返回要通告的并发流上限。
    pub fn flush_settings(&self) -> Option<u32> {
        self.state.lock().settings.poll_settings()
    }

    /// 对端确认设置；上限回升后重试等待准入的流。
    pub fn ack_settings(&self) {
        let settled = {
            let mut state = self.state.lock();
            state.settings.on_settings_ack();
            state.pump()
        };
        self.dispatch(settled);
    }

    /// 当前允许的并发流上限。
    pub fn advertised_streams(&self) -> u32 {
        self.state.lock().settings.advertised()
    }

    /// 当前活跃的流数量。
    pub fn active_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// 停放中的批次数量。
    pub fn parked_batches(&self) -> usize {
        self.state.lock().parked.len()
    }

    pub fn stats(&self) -> LoopbackStats {
        self.state.lock().stats
    }

    /// 关闭连接：停放的批次全部以失败完成，等待握手的就绪回调随即执行，此后到达的批次立即失败。
    pub fn close(&self) {
        let (parked, waiters) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.ready = false;
            state.streams.clear();
            (
                std::mem::take(&mut state.parked),
                std::mem::take(&mut state.waiters),
            )
        };
        debug!(
            failed = parked.len(),
            waiters = waiters.len(),
            "loopback connection closed"
        );
        for waiter in waiters {
            waiter();
        }
        self.dispatch(
            parked
                .into_iter()
                .map(|entry| (entry.completion, BatchResult::failure()))
                .collect(),
        );
    }

    fn dispatch(&self, settled: Vec<Settled>) {
        #[cfg(feature = "runtime-tokio")]
        {
            if let Some(runtime) = &self.runtime {
                for (completion, result) in settled {
                    runtime.spawn(async move { completion.complete(result) });
                }
                return;
            }
        }
        for (completion, result) in settled {
            completion.complete(result);
        }
    }
}

impl ConnectionState {
    /// 反复扫描停放队列，直到一整轮没有任何批次取得进展。
    fn pump(&mut self) -> Vec<Settled> {
        let mut settled = Vec::new();
        loop {
            let mut progressed = false;
            // 一轮内首个准入失败之后，不再为排在其后的新流分配名额，保持 FIFO。
            let mut admission_blocked = false;
            let mut finished = Vec::new();
            let mut remaining = VecDeque::with_capacity(self.parked.len());
            while let Some(mut entry) = self.parked.pop_front() {
                if finished.contains(&entry.call_id) {
                    settled.push((entry.completion, BatchResult::failure()));
                    continue;
                }
                if entry.sends.is_some() {
                    let admitted = if admission_blocked {
                        self.streams.contains_key(&entry.call_id)
                    } else {
                        self.admit(entry.call_id)
                    };
                    if !admitted {
                        admission_blocked = true;
                        remaining.push_back(entry);
                        continue;
                    }
                    let sends = entry.sends.take().unwrap_or_default();
                    self.apply_sends(entry.call_id, sends);
                    progressed = true;
                }
                match self.try_receive(entry.call_id, &entry.receives) {
                    Some((result, stream_finished)) => {
                        if stream_finished {
                            finished.push(entry.call_id);
                        }
                        settled.push((entry.completion, result));
                        progressed = true;
                    }
                    None => remaining.push_back(entry),
                }
            }
            // 流结束之后，同一调用排在前面的接收再也无法满足。
            for entry in remaining.drain(..) {
                if finished.contains(&entry.call_id) {
                    settled.push((entry.completion, BatchResult::failure()));
                } else {
                    self.parked.push_back(entry);
                }
            }
            if !progressed {
                return settled;
            }
        }
    }

    /// 为调用分配流；已有流直接通过，新流受通告上限约束。
    fn admit(&mut self, call_id: CallId) -> bool {
        if self.streams.contains_key(&call_id) {
            return true;
        }
        let limit = self.settings.advertised() as usize;
        if self.streams.len() >= limit {
            return false;
        }
        self.streams.insert(call_id, Stream::default());
        self.stats.admitted_streams += 1;
        trace!(%call_id, active = self.streams.len(), limit, "stream admitted");
        true
    }

    fn apply_sends(&mut self, call_id: CallId, sends: Vec<Op>) {
        for op in sends {
            match op {
                Op::SendInitialMetadata(metadata) => {
                    for (name, value) in metadata.iter() {
                        if self.headers.should_index(name.as_bytes(), value) {
                            self.stats.indexed_headers += 1;
                        } else {
                            self.stats.literal_headers += 1;
                        }
                    }
                    if let Some(stream) = self.streams.get_mut(&call_id) {
                        stream.echo_metadata = Some(metadata);
                    }
                }
                Op::SendMessage(message) => {
                    if let Some(stream) = self.streams.get_mut(&call_id) {
                        stream.inbox.push_back(message);
                    }
                }
                Op::SendCloseFromClient => {
                    if let Some(stream) = self.streams.get_mut(&call_id) {
                        stream.half_closed = true;
                    }
                }
                Op::RecvInitialMetadata | Op::RecvMessage | Op::RecvStatusOnClient => {}
            }
        }
    }

    /// 全部接收操作都可满足时一次性取出结果，并报告流是否随之结束；否则不改变任何状态。
    fn try_receive(
        &mut self,
        call_id: CallId,
        receives: &[OpKind],
    ) -> Option<(BatchResult, bool)> {
        let stream = self.streams.get_mut(&call_id)?;
        let satisfiable = receives.iter().all(|kind| match kind {
            OpKind::RecvInitialMetadata => stream.echo_metadata.is_some(),
            OpKind::RecvMessage => !stream.inbox.is_empty() || stream.half_closed,
            OpKind::RecvStatusOnClient => stream.half_closed,
            _ => true,
        });
        if !satisfiable {
            return None;
        }

        let mut result = BatchResult::success();
        let mut finished = false;
        for kind in receives {
            match kind {
                OpKind::RecvInitialMetadata => {
                    if let Some(metadata) = stream.echo_metadata.take() {
                        result = result.with_initial_metadata(metadata);
                    }
                }
                OpKind::RecvMessage => {
                    if let Some(message) = stream.inbox.pop_front() {
                        result = result.with_message(message);
                    }
                }
                OpKind::RecvStatusOnClient => {
                    result = result.with_status(Status::ok());
                    finished = true;
                }
                _ => {}
            }
        }
        if finished {
            self.streams.remove(&call_id);
            trace!(%call_id, active = self.streams.len(), "stream finished");
        }
        Some((result, finished))
    }
}

impl Transport for LoopbackConnection {
    fn send(&self, batch: TransportBatch) {
        let call_id = batch.call_id();
        let (ops, completion) = batch.into_parts();
        let settled = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                completion.complete(BatchResult::failure());
                return;
            }
            let (sends, receives): (Vec<Op>, Vec<Op>) = ops.into_iter().partition(|op| {
                matches!(
                    op.kind(),
                    OpKind::SendInitialMetadata | OpKind::SendMessage | OpKind::SendCloseFromClient
                )
            });
            state.parked.push_back(Parked {
                call_id,
                sends: Some(sends),
                receives: receives.iter().map(Op::kind).collect(),
                completion,
            });
            state.pump()
        };
        self.dispatch(settled);
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
        let (dropped, settled) = {
            let mut state = self.state.lock();
            let mut dropped = Vec::new();
            let mut kept = VecDeque::with_capacity(state.parked.len());
            for entry in state.parked.drain(..) {
                if entry.call_id == call {
                    dropped.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            state.parked = kept;
            if state.streams.remove(&call).is_some() {
                state.settings.on_stream_reset();
                state.stats.reset_streams += 1;
                debug!(%call, advertised = state.settings.advertised(), "stream reset");
            }
            (dropped, state.pump())
        };
        // 被取消调用的批次已由取消路径结算，释放句柄即可。
        drop(dropped);
        self.dispatch(settled);
    }
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackConnection")
            .field("ready", &state.ready)
            .field("closed", &state.closed)
            .field("active_streams", &state.streams.len())
            .field("parked", &state.parked.len())
            .field("advertised", &state.settings.advertised())
            .finish()
    }
}

/// 为每次连接尝试创建一条回环连接的连接器。
pub struct LoopbackConnector {
    settings: H2Settings,
    handshake: bool,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
    #[cfg(feature = "runtime-tokio")]
    runtime: Option<tokio::runtime::Handle>,
}

impl LoopbackConnector {
    pub fn new(settings: H2Settings) -> Self {
        Self {
            settings,
            handshake: false,
            connections: Mutex::new(Vec::new()),
            #[cfg(feature = "runtime-tokio")]
            runtime: None,
        }
    }

    /// 此后创建的连接以握手中状态开始。
    pub fn with_handshake(mut self) -> Self {
        self.handshake = true;
        self
    }

    #[cfg(feature = "runtime-tokio")]
    pub fn with_runtime(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// 最近一次创建的连接。
    pub fn last_connection(&self) -> Option<Arc<LoopbackConnection>> {
        self.connections.lock().last().cloned()
    }

    pub fn connections(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Connector for LoopbackConnector {
    fn connect(
        &self,
        key: &SubchannelKey,
        _timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        let connection = if self.handshake {
            LoopbackConnection::handshaking(&self.settings)
        } else {
            LoopbackConnection::new(&self.settings)
        };
        #[cfg(feature = "runtime-tokio")]
        let connection = match &self.runtime {
            Some(handle) => connection.with_runtime(handle.clone()),
            None => connection,
        };
        let connection = Arc::new(connection);
        self.connections.lock().push(Arc::clone(&connection));
        debug!(subchannel = %key, "loopback connection established");
        Ok(connection)
    }
}
