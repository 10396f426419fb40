//! 运行时配置。
//!
//! ### 设计目的（Why）
//! - 把 Arena 预留尺寸、完成队列 pluck 并发上限、子通道重连退避参数集中到一个可序列化结构，
//!   部署侧通过 TOML 覆盖，代码侧只读取已校验的快照；
//! - 缺失的段落回落到默认值，使最小配置文件可以为空。
//!
//! ### 契约说明（What）
//! - [`RuntimeConfig::from_toml_str`] 先解析再校验，任何越界值返回 [`ConfigError::Invalid`]；
//! - 默认值：`max_pluckers = 6`，退避 `initial 1s / multiplier 1.6 / jitter 0.2 /
//!   min_connect_timeout 20s / max 120s`。

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 运行时配置根节点。
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub arena: ArenaConfig,
    pub completion_queue: CompletionQueueConfig,
    pub subchannel: SubchannelConfig,
}

impl RuntimeConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验所有字段的取值范围。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_queue.max_pluckers == 0 {
            return Err(ConfigError::Invalid {
                field: "completion_queue.max_pluckers",
                reason: "at least one plucker must be allowed".to_owned(),
            });
        }
        self.subchannel.backoff.validate()
    }
}

/// Arena 初始预留尺寸。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ArenaConfig {
    /// 调用尚无历史用量时首个 Zone 的字节数。
    pub initial_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_ARENA_INITIAL_SIZE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionQueueConfig {
    /// 同时阻塞在 `pluck` 上的线程上限。
    pub max_pluckers: usize,
}

impl Default for CompletionQueueConfig {
    fn default() -> Self {
        Self {
            max_pluckers: DEFAULT_MAX_PLUCKERS,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SubchannelConfig {
    pub backoff: BackoffConfig,
}

/// 子通道重连退避参数。
///
/// # 契约说明（What）
/// - 第 `n` 次失败后的基础间隔为 `initial * multiplier^n`，上限 `max`；
/// - 实际间隔在基础间隔上叠加 `±jitter` 比例的确定性抖动；
/// - 单次连接尝试至少获得 `min_connect_timeout` 的时间窗口。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub min_connect_timeout_ms: u64,
    pub max_ms: u64,
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    pub fn min_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.min_connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "subchannel.backoff.multiplier",
                reason: format!("must be >= 1.0, got {}", self.multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid {
                field: "subchannel.backoff.jitter",
                reason: format!("must be within [0, 1], got {}", self.jitter),
            });
        }
        if self.initial_ms > self.max_ms {
            return Err(ConfigError::Invalid {
                field: "subchannel.backoff.initial_ms",
                reason: format!(
                    "initial backoff {}ms exceeds max backoff {}ms",
                    self.initial_ms, self.max_ms
                ),
            });
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 1.6,
            jitter: 0.2,
            min_connect_timeout_ms: 20_000,
            max_ms: 120_000,
        }
    }
}

/// Arena 首个 Zone 的默认字节数。
pub const DEFAULT_ARENA_INITIAL_SIZE: usize = 1_024;

/// `pluck` 并发上限默认值。
pub const DEFAULT_MAX_PLUCKERS: usize = 6;
