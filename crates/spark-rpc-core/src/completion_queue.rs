//! 完成队列：应用线程轮询/阻塞获取批次完成事件的多路复用器。
//!
//! # 教案式说明
//! - **意图（Why）**：调用引擎把每个批次的结果折叠成 `(tag, success)` 事件，应用只需在少量线程上
//!   排空队列即可驱动任意数量的并发调用；
//! - **契约（What）**：
//!   - 每个被接受的批次（`begin_op`）恰好产生一次完成事件（`end_op`）；
//!   - `shutdown` 幂等，之后不再接受新批次，但已接受批次仍会投递完成事件；
//!   - `next` 在全部已接受事件被取走之前绝不返回 [`Event::Shutdown`]；
//! - **逻辑（How）**：待决计数器以 1 起步，这一份保留额度在 `shutdown` 时归还；每次 `begin_op`
//!   仅在计数器非零时自增，每次 `end_op` 自减，计数器归零即代表关闭完成；
//! - **注意事项（Trade-offs）**：事件集合与等待者共享一把短临界区互斥锁与一个条件变量，
//!   `end_op` 使用 `notify_all` 唤醒所有等待者，由各自按 tag 过滤。
//!   `pluck` 并发数受限，超出上限的调用立即以超时返回。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as StdOrdering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::config::{CompletionQueueConfig, DEFAULT_MAX_PLUCKERS};
use crate::sync::{AtomicUsize, Ordering};
use crate::time::Deadline;

/// 应用提供的不透明关联令牌。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag(u64);

impl Tag {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Tag {
    fn from(value: u64) -> Self {
        Tag(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// `next`/`pluck` 的返回结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// 某个批次完成。
    Complete { tag: Tag, success: bool },
    /// 截止时间到达前没有可用事件。
    Timeout,
    /// 队列已关闭且排空。
    Shutdown,
}

/// 以 1 起步的“仅非零时自增”计数器。
///
/// # 契约说明（What）
/// - 初始值 1 代表关闭前的保留额度；
/// - [`PendingEvents::try_begin`] 仅在计数器非零时自增，归零后永远失败；
/// - [`PendingEvents::finish_one`] 自减并在恰好归零时返回 `true`，对零值再减视为账目损坏并 panic。
#[derive(Debug)]
pub struct PendingEvents {
    count: AtomicUsize,
}

impl PendingEvents {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// 仅当计数器非零时自增，返回是否成功。
    pub fn try_begin(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// 自减一次；返回本次是否使计数器归零。
    pub fn finish_one(&self) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "pending event counter underflow");
        previous == 1
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for PendingEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// 完成队列句柄，克隆后共享同一队列。
#[derive(Clone)]
pub struct CompletionQueue {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    max_pluckers: usize,
    pending: PendingEvents,
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<(Tag, bool)>,
    outstanding: HashMap<Tag, usize>,
    shutdown_called: bool,
    shutdown_done: bool,
    active_pluckers: usize,
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

impl CompletionQueue {
    /// 以默认配置创建队列。
    pub fn new() -> Self {
        Self::build(DEFAULT_MAX_PLUCKERS)
    }

    pub fn with_config(config: &CompletionQueueConfig) -> Self {
        Self::build(config.max_pluckers.max(1))
    }

    fn build(max_pluckers: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_QUEUE_ID.fetch_add(1, StdOrdering::Relaxed),
                max_pluckers,
                pending: PendingEvents::new(),
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// 进程内唯一的队列编号，用于日志关联。
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// 两个句柄是否指向同一队列。
    pub fn same_queue(&self, other: &CompletionQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 登记一个即将完成的操作。
    ///
    /// # Panics
    /// 队列已请求关闭时调用属于编程错误：记录 `error!` 后 panic。
    pub fn begin_op(&self, tag: Tag) {
        let mut state = self.shared.state.lock();
        if state.shutdown_called || !self.shared.pending.try_begin() {
            error!(
                cq = self.shared.id,
                %tag,
                "operation submitted against a shut-down completion queue"
            );
            panic!("completion queue {} is shut down; {tag} rejected", self.shared.id);
        }
        *state.outstanding.entry(tag).or_insert(0) += 1;
        trace!(cq = self.shared.id, %tag, "operation begun");
    }

    /// 投递一次完成事件。
    ///
    /// # Panics
    /// `tag` 未经 `begin_op` 登记（或已被完成）时记录 `error!` 后 panic。
    pub fn end_op(&self, tag: Tag, success: bool) {
        let mut state = self.shared.state.lock();
        match state.outstanding.get_mut(&tag) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                state.outstanding.remove(&tag);
            }
            None => {
                error!(
                    cq = self.shared.id,
                    %tag,
                    "completion for a tag that is not outstanding"
                );
                panic!("{tag} is not outstanding on completion queue {}", self.shared.id);
            }
        }
        if !success {
            debug!(cq = self.shared.id, %tag, "operation completed unsuccessfully");
        }
        state.events.push_back((tag, success));
        if self.shared.pending.finish_one() {
            state.shutdown_done = true;
            debug!(cq = self.shared.id, "completion queue drained after shutdown");
        }
        drop(state);
        self.shared.ready.notify_all();
    }

    /// 取出下一个事件，最迟阻塞到 `deadline`。
    pub fn next(&self, deadline: impl Into<Deadline>) -> Event {
        let deadline = deadline.into();
        let mut state = self.shared.state.lock();
        loop {
            if let Some((tag, success)) = state.events.pop_front() {
                return Event::Complete { tag, success };
            }
            if state.shutdown_done {
                return Event::Shutdown;
            }
            if !self.wait(&mut state, deadline) {
                return Event::Timeout;
            }
        }
    }

    /// 取出指定 `tag` 的事件，其余事件保持原有顺序留在队列中。
    ///
    /// 关闭完成后即使仍有无关事件排队也返回 [`Event::Shutdown`]；
    /// 并发 `pluck` 超过上限时记录告警并立即返回 [`Event::Timeout`]。
    pub fn pluck(&self, tag: Tag, deadline: impl Into<Deadline>) -> Event {
        let deadline = deadline.into();
        let mut state = self.shared.state.lock();
        if state.active_pluckers >= self.shared.max_pluckers {
            warn!(
                cq = self.shared.id,
                %tag,
                limit = self.shared.max_pluckers,
                "too many concurrent pluckers; returning timeout"
            );
            return Event::Timeout;
        }
        state.active_pluckers += 1;
        let event = loop {
            if let Some(position) = state.events.iter().position(|(queued, _)| *queued == tag) {
                if let Some((tag, success)) = state.events.remove(position) {
                    break Event::Complete { tag, success };
                }
            }
            if state.shutdown_done {
                break Event::Shutdown;
            }
            if !self.wait(&mut state, deadline) {
                break Event::Timeout;
            }
        };
        state.active_pluckers -= 1;
        event
    }

    /// 请求关闭队列，幂等。
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown_called {
            return;
        }
        state.shutdown_called = true;
        debug!(
            cq = self.shared.id,
            outstanding = state.outstanding.len(),
            "completion queue shutdown requested"
        );
        if self.shared.pending.finish_one() {
            state.shutdown_done = true;
        }
        drop(state);
        self.shared.ready.notify_all();
    }

    /// 是否已请求关闭。
    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.state.lock().shutdown_called
    }

    /// 已接受但尚未完成的操作数量。
    pub fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding.values().sum()
    }

    /// 返回 `false` 表示截止时间已到。
    fn wait(&self, state: &mut MutexGuard<'_, QueueState>, deadline: Deadline) -> bool {
        match deadline.instant() {
            None => {
                self.shared.ready.wait(state);
                true
            }
            Some(at) => {
                if Instant::now() >= at {
                    return false;
                }
                self.shared.ready.wait_until(state, at);
                true
            }
        }
    }

    #[cfg(test)]
    fn active_pluckers(&self) -> usize {
        self.shared.state.lock().active_pluckers
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("id", &self.shared.id)
            .field("pending", &self.shared.pending.current())
            .finish()
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn next_returns_queued_events_before_shutdown() {
        let cq = CompletionQueue::new();
        cq.begin_op(Tag::new(1));
        cq.begin_op(Tag::new(2));
        cq.shutdown();
        assert_eq!(cq.next(Deadline::immediate()), Event::Timeout);
        cq.end_op(Tag::new(1), true);
        cq.end_op(Tag::new(2), false);
        assert_eq!(
            cq.next(Deadline::immediate()),
            Event::Complete { tag: Tag::new(1), success: true }
        );
        assert_eq!(
            cq.next(Deadline::immediate()),
            Event::Complete { tag: Tag::new(2), success: false }
        );
        assert_eq!(cq.next(Deadline::none()), Event::Shutdown);
        assert_eq!(cq.next(Deadline::none()), Event::Shutdown);
    }

    #[test]
    fn pluck_skips_unrelated_events() {
        let cq = CompletionQueue::new();
        for tag in 1..=3 {
            cq.begin_op(Tag::new(tag));
        }
        for tag in 1..=3 {
            cq.end_op(Tag::new(tag), true);
        }
        assert_eq!(
            cq.pluck(Tag::new(2), Deadline::immediate()),
            Event::Complete { tag: Tag::new(2), success: true }
        );
        assert_eq!(
            cq.next(Deadline::immediate()),
            Event::Complete { tag: Tag::new(1), success: true }
        );
        assert_eq!(
            cq.next(Deadline::immediate()),
            Event::Complete { tag: Tag::new(3), success: true }
        );
    }

    #[test]
    #[should_panic(expected = "shut down")]
    fn begin_after_shutdown_is_fatal() {
        let cq = CompletionQueue::new();
        cq.shutdown();
        cq.begin_op(Tag::new(9));
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn double_completion_is_fatal() {
        let cq = CompletionQueue::new();
        cq.begin_op(Tag::new(4));
        cq.end_op(Tag::new(4), true);
        cq.end_op(Tag::new(4), true);
    }

    #[test]
    #[traced_test]
    fn plucker_overflow_times_out_with_warning() {
        let cq = CompletionQueue::with_config(&CompletionQueueConfig { max_pluckers: 1 });
        cq.begin_op(Tag::new(7));
        let waiter = {
            let cq = cq.clone();
            thread::spawn(move || cq.pluck(Tag::new(7), Deadline::after(Duration::from_secs(5))))
        };
        while cq.active_pluckers() == 0 {
            thread::yield_now();
        }
        assert_eq!(cq.pluck(Tag::new(8), Deadline::none()), Event::Timeout);
        assert!(logs_contain("too many concurrent pluckers"));

        cq.end_op(Tag::new(7), true);
        assert_eq!(
            waiter.join().expect("pluck 线程不应 panic"),
            Event::Complete { tag: Tag::new(7), success: true }
        );
    }
}
