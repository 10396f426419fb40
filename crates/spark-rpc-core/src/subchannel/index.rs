//! 进程级子通道去重索引。
//!
//! # 教案式说明
//! - **意图（Why）**：多个 Channel 指向同一 `(地址, 参数)` 时应共享同一条物理连接；
//!   索引是这一去重关系的唯一事实来源。
//! - **契约（What）**：
//!   - 同一键在任意时刻至多对应一个存活子通道（除非测试显式关闭去重）；
//!   - 条目是弱引用，不延长子通道寿命，最后一个持有者释放时子通道自行注销；
//!   - 读路径（`find`）永不阻塞；写路径（`register`/注销）是有界的乐观重试循环。
//! - **逻辑（How）**：根节点是 `ArcSwap<BTreeMap<..>>`，写者读取快照、复制并修改，
//!   再以 `compare_and_swap` 仅在根未变化时替换；失败则基于新快照重试。
//!   复制时顺带剔除已失效的弱引用。
//! - **注意事项（Trade-offs）**：每次写入复制整棵映射，适用于“读多写少、条目数中等”的连接池场景。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use super::key::SubchannelKey;
use super::{Subchannel, SubchannelHandle};

type Snapshot = BTreeMap<SubchannelKey, Weak<Subchannel>>;

/// 子通道索引句柄，克隆后共享同一索引。
#[derive(Clone)]
pub struct SubchannelIndex {
    shared: Arc<IndexShared>,
}

pub(crate) struct IndexShared {
    root: ArcSwap<Snapshot>,
    force_different: AtomicBool,
}

static GLOBAL: RwLock<Option<SubchannelIndex>> = RwLock::new(None);

impl SubchannelIndex {
    /// 创建独立索引，测试与嵌入场景使用。
    pub fn new() -> Self {
        Self {
            shared: Arc::new(IndexShared {
                root: ArcSwap::from_pointee(BTreeMap::new()),
                force_different: AtomicBool::new(false),
            }),
        }
    }

    /// 初始化进程级索引；重复调用保留已有实例。
    pub fn init() {
        let mut global = GLOBAL.write();
        if global.is_none() {
            *global = Some(SubchannelIndex::new());
            info!("global subchannel index initialized");
        }
    }

    /// 访问进程级索引。
    ///
    /// # Panics
    /// 未调用 [`SubchannelIndex::init`]（或已 [`SubchannelIndex::shutdown`]）时访问属于编程错误。
    pub fn global() -> SubchannelIndex {
        match GLOBAL.read().as_ref() {
            Some(index) => index.clone(),
            None => {
                error!("global subchannel index accessed before init");
                panic!("SubchannelIndex::global() called before SubchannelIndex::init()");
            }
        }
    }

    /// 拆除进程级索引，并关闭其中仍存活的子通道。
    pub fn shutdown() {
        let taken = GLOBAL.write().take();
        if let Some(index) = taken {
            let live = index.live_subchannels();
            for subchannel in &live {
                subchannel.shutdown();
            }
            info!(live = live.len(), "global subchannel index shut down");
        }
    }

    /// 查找 `key` 对应的存活子通道。
    pub fn find(&self, key: &SubchannelKey) -> Option<SubchannelHandle> {
        if self.shared.force_different.load(Ordering::Acquire) {
            return None;
        }
        self.shared
            .root
            .load()
            .get(key)
            .and_then(Weak::upgrade)
            .map(SubchannelHandle::from_arc)
    }

    /// 注册候选子通道；若已有并发注册的胜者，释放候选并返回胜者。
    pub fn register(&self, key: SubchannelKey, candidate: SubchannelHandle) -> SubchannelHandle {
        if self.shared.force_different.load(Ordering::Acquire) {
            return candidate;
        }
        loop {
            let snapshot = self.shared.root.load_full();
            if let Some(winner) = snapshot.get(&key).and_then(Weak::upgrade) {
                debug!(subchannel = %key, "lost registration race; reusing existing subchannel");
                return SubchannelHandle::from_arc(winner);
            }
            let mut next: Snapshot = snapshot
                .iter()
                .filter(|(_, entry)| entry.strong_count() > 0)
                .map(|(k, entry)| (k.clone(), entry.clone()))
                .collect();
            next.insert(key.clone(), candidate.downgrade());
            let previous = self
                .shared
                .root
                .compare_and_swap(&snapshot, Arc::new(next));
            if Arc::ptr_eq(&previous, &snapshot) {
                debug!(subchannel = %key, id = candidate.id(), "subchannel registered");
                return candidate;
            }
        }
    }

    /// 查找已有子通道，不存在时用 `factory` 构造并注册。
    ///
    /// `factory` 在竞争中落败时产生的候选会被直接释放。
    pub fn find_or_register<F>(&self, key: &SubchannelKey, factory: F) -> SubchannelHandle
    where
        F: FnOnce(&SubchannelIndex) -> SubchannelHandle,
    {
        if let Some(existing) = self.find(key) {
            return existing;
        }
        let candidate = factory(self);
        self.register(key.clone(), candidate)
    }

    /// 关闭去重：此后每次注册都视为唯一，`find` 总是未命中。仅供测试隔离使用。
    pub fn test_only_set_force_different(&self, force: bool) {
        self.shared.force_different.store(force, Ordering::Release);
    }

    /// 当前快照中仍存活的条目数。
    pub fn len(&self) -> usize {
        self.shared
            .root
            .load()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_subchannels(&self) -> Vec<SubchannelHandle> {
        self.shared
            .root
            .load()
            .values()
            .filter_map(Weak::upgrade)
            .map(SubchannelHandle::from_arc)
            .collect()
    }

    pub(crate) fn downgrade(&self) -> Weak<IndexShared> {
        Arc::downgrade(&self.shared)
    }
}

impl IndexShared {
    /// 仅当条目仍指向 `target` 时移除，避免误删同键的新胜者。
    pub(crate) fn unregister(&self, key: &SubchannelKey, target: *const Subchannel) {
        loop {
            let snapshot = self.root.load_full();
            match snapshot.get(key) {
                Some(entry) if std::ptr::eq(entry.as_ptr(), target) => {}
                _ => return,
            }
            let mut next: Snapshot = (*snapshot).clone();
            next.remove(key);
            let previous = self.root.compare_and_swap(&snapshot, Arc::new(next));
            if Arc::ptr_eq(&previous, &snapshot) {
                debug!(subchannel = %key, "subchannel unregistered");
                return;
            }
        }
    }
}

impl Default for SubchannelIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubchannelIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchannelIndex")
            .field("live", &self.len())
            .field(
                "force_different",
                &self.shared.force_different.load(Ordering::Relaxed),
            )
            .finish()
    }
}
