//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义调用引擎对外暴露的同步错误：提交校验失败、连接建立失败、配置解析失败；
//! - 批次失败**不在此列**：它们只以 `success=false` 的完成事件与调用最终 [`Status`](crate::Status)
//!   呈现，永远不会作为 `Err` 传播。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，并通过 `code()` 暴露稳定的点分错误码，
//!   便于日志检索与告警规则长期保持不变；
//! - 连接错误额外提供 `retryable()`，供子通道决定是否进入退避重连。

use std::time::Duration;

use thiserror::Error;

use crate::call::OpKind;

/// 调用提交被拒绝的原因。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CallError {
    /// 终止批次（携带 `RecvStatusOnClient`）已经提交或调用已被取消，不再接受新批次。
    #[error("call {call_id} already finished; no further batches are accepted")]
    AlreadyFinished { call_id: u64 },

    /// 同一批次重复出现某类操作，或该类操作仍有在途批次占用槽位。
    #[error("operation {kind:?} is already pending on call {call_id}")]
    TooManyOperations { call_id: u64, kind: OpKind },

    /// 元数据键为空字符串。
    #[error("metadata key must not be empty")]
    EmptyMetadataKey,
}

impl CallError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            CallError::AlreadyFinished { .. } => "spark.rpc.call.already_finished",
            CallError::TooManyOperations { .. } => "spark.rpc.call.too_many_operations",
            CallError::EmptyMetadataKey => "spark.rpc.call.empty_metadata_key",
        }
    }
}

/// 子通道建立连接失败的原因。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“值得稍后再试”与“再试也无意义”的失败，让退避策略只作用于前者；
/// - **契约 (What)**：`retryable()` 为 `true` 的变体会推进退避计时器；`BackingOff` 本身不推进，
///   只表示当前仍处于上一次失败后的等待窗口；
/// - **风险 (Trade-offs)**：`Refused` 携带字符串原因，牺牲一次分配换取可读诊断信息。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectError {
    /// 鉴权信号在子通道创建时给出了否定结论。
    #[error("subchannel to {address} is not authorized")]
    Unauthorized { address: String },

    /// 上一次失败后的退避窗口尚未结束。
    #[error("subchannel is backing off; next attempt allowed in {remaining:?}")]
    BackingOff { remaining: Duration },

    /// 对端或连接器拒绝建立连接。
    #[error("connection to {address} refused: {reason}")]
    Refused { address: String, reason: String },

    /// 连接尝试超过最小连接超时仍未完成。
    #[error("connection to {address} timed out")]
    TimedOut { address: String },

    /// 子通道已从索引移除并关闭。
    #[error("subchannel has been shut down")]
    Shutdown,
}

impl ConnectError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::Unauthorized { .. } => "spark.rpc.subchannel.unauthorized",
            ConnectError::BackingOff { .. } => "spark.rpc.subchannel.backing_off",
            ConnectError::Refused { .. } => "spark.rpc.subchannel.connect_refused",
            ConnectError::TimedOut { .. } => "spark.rpc.subchannel.connect_timeout",
            ConnectError::Shutdown => "spark.rpc.subchannel.shutdown",
        }
    }

    /// 是否应进入退避后重试。
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::Refused { .. } | ConnectError::TimedOut { .. }
        )
    }
}

/// 运行时配置解析或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 文本无法解析为配置结构。
    #[error("failed to parse runtime configuration: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },

    /// 字段取值越界。
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Parse { .. } => "spark.rpc.config.parse_failed",
            ConfigError::Invalid { .. } => "spark.rpc.config.invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_connect_failures_are_retryable() {
        let refused = ConnectError::Refused {
            address: "10.0.0.1:443".to_owned(),
            reason: "reset".to_owned(),
        };
        assert!(refused.retryable());
        assert!(
            !ConnectError::Unauthorized {
                address: "10.0.0.1:443".to_owned()
            }
            .retryable()
        );
        assert!(
            !ConnectError::BackingOff {
                remaining: Duration::from_millis(5)
            }
            .retryable()
        );
        assert_eq!(refused.code(), "spark.rpc.subchannel.connect_refused");
    }
}
