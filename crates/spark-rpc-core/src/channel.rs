//! 通道：绑定目标子通道键与连接能力，负责创建调用。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::call::Call;
use crate::completion_queue::CompletionQueue;
use crate::config::{BackoffConfig, RuntimeConfig};
use crate::subchannel::index::SubchannelIndex;
use crate::subchannel::key::SubchannelKey;
use crate::subchannel::{Subchannel, SubchannelHandle};
use crate::transport::{AllowAll, Authorizer, Connector};

/// 调用 Arena 预留尺寸的在线估算器。
///
/// # 教案式说明
/// - **意图（Why）**：首个 Zone 太小会让调用在热路径上反复扩容，太大则浪费内存；
///   用已结束调用的真实用量自适应地调整预留值。
/// - **契约（What）**：
///   - `estimate()` 返回 `(current + 2 * 256)` 向下对齐到 256 的结果，始终留出余量；
///   - `update(used)` 在 `used > current` 时立即抬升；更小时以 `1/256` 的速率缓慢衰减，且每次至少减 1；
/// - **逻辑（How）**：单个原子整数，`update` 以 CAS 循环提交，失败时基于新值重算。
#[derive(Debug)]
pub struct CallSizeEstimator {
    current: AtomicUsize,
}

const ROUND_UP_SIZE: usize = 256;

impl CallSizeEstimator {
    pub fn new(initial: usize) -> Self {
        Self {
            current: AtomicUsize::new(initial),
        }
    }

    pub fn estimate(&self) -> usize {
        let current = self.current.load(Ordering::Relaxed);
        current.saturating_add(2 * ROUND_UP_SIZE) & !(ROUND_UP_SIZE - 1)
    }

    pub fn update(&self, used: usize) {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            let next = if used > current {
                used
            } else if used == current {
                return;
            } else {
                let decayed = current.saturating_mul(255).saturating_add(used) / 256;
                decayed.min(current - 1)
            };
            match self.current.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// 未加余量的当前估计值。
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }
}

pub(crate) struct ChannelCore {
    key: SubchannelKey,
    index: SubchannelIndex,
    connector: Arc<dyn Connector>,
    authorizer: Arc<dyn Authorizer>,
    backoff: BackoffConfig,
    estimator: CallSizeEstimator,
}

impl ChannelCore {
    pub(crate) fn estimator(&self) -> &CallSizeEstimator {
        &self.estimator
    }

    /// 查找或创建目标子通道。
    pub(crate) fn subchannel(&self) -> SubchannelHandle {
        self.index.find_or_register(&self.key, |index| {
            Subchannel::create(
                index,
                self.key.clone(),
                Arc::clone(&self.connector),
                self.authorizer.as_ref(),
                &self.backoff,
            )
        })
    }
}

/// 指向单一目标的通道。
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl Channel {
    pub fn builder(key: SubchannelKey) -> ChannelBuilder {
        ChannelBuilder {
            key,
            index: None,
            connector: None,
            authorizer: Arc::new(AllowAll),
            config: RuntimeConfig::default(),
        }
    }

    /// 创建绑定到 `cq` 的调用。
    pub fn create_call(&self, cq: &CompletionQueue) -> Call {
        Call::new(cq.clone(), Arc::clone(&self.core))
    }

    pub fn key(&self) -> &SubchannelKey {
        &self.core.key
    }

    pub fn index(&self) -> &SubchannelIndex {
        &self.core.index
    }

    /// 下一次调用的 Arena 预留尺寸。
    pub fn estimated_call_size(&self) -> usize {
        self.core.estimator.estimate()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.core.key)
            .field("estimated_call_size", &self.estimated_call_size())
            .finish()
    }
}

/// [`Channel`] 构造器。
///
/// 未指定索引时使用进程级索引（[`SubchannelIndex::global`]，需先 `init`）；连接器为必填项。
pub struct ChannelBuilder {
    key: SubchannelKey,
    index: Option<SubchannelIndex>,
    connector: Option<Arc<dyn Connector>>,
    authorizer: Arc<dyn Authorizer>,
    config: RuntimeConfig,
}

impl ChannelBuilder {
    pub fn index(mut self, index: SubchannelIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// # Panics
    /// 未提供连接器时 panic。
    pub fn build(self) -> Channel {
        let Some(connector) = self.connector else {
            panic!("ChannelBuilder::build requires a connector");
        };
        let index = self.index.unwrap_or_else(SubchannelIndex::global);
        Channel {
            core: Arc::new(ChannelCore {
                key: self.key,
                index,
                connector,
                authorizer: self.authorizer,
                backoff: self.config.subchannel.backoff.clone(),
                estimator: CallSizeEstimator::new(self.config.arena.initial_size),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_adds_headroom_and_rounds_down() {
        let estimator = CallSizeEstimator::new(1_000);
        assert_eq!(estimator.estimate(), 1_280);
        let estimator = CallSizeEstimator::new(0);
        assert_eq!(estimator.estimate(), 512);
    }

    #[test]
    fn update_ratchets_up_and_decays_slowly() {
        let estimator = CallSizeEstimator::new(1_024);
        estimator.update(4_096);
        assert_eq!(estimator.current(), 4_096);

        estimator.update(0);
        assert_eq!(estimator.current(), 4_080, "每次衰减约 1/256");

        let estimator = CallSizeEstimator::new(10);
        estimator.update(9);
        assert_eq!(estimator.current(), 9, "衰减至少为 1");
        estimator.update(9);
        assert_eq!(estimator.current(), 9);
    }
}
