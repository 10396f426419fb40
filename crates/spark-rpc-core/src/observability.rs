//! 日志引导：为运行时安装全局 `tracing` 订阅者。

use std::sync::OnceLock;

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALLED: OnceLock<()> = OnceLock::new();

/// 日志引导失败的原因。
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// 本模块已经安装过订阅者。
    #[error("spark-rpc-core observability already installed")]
    AlreadyInstalled,
    /// 进程内已有其他全局订阅者。
    #[error("a global tracing subscriber is already set")]
    SubscriberAlreadySet,
}

impl ObservabilityError {
    pub fn code(&self) -> &'static str {
        match self {
            ObservabilityError::AlreadyInstalled => "spark.rpc.observability.already_installed",
            ObservabilityError::SubscriberAlreadySet => {
                "spark.rpc.observability.subscriber_already_set"
            }
        }
    }
}

/// 安装 `fmt + EnvFilter` 全局订阅者。
///
/// # 教案式说明
/// - **意图（Why）**：引擎内部的诊断全部经由 `tracing` 宏输出，宿主只需调用一次即可看到
///   调用、完成队列、子通道的结构化日志；
/// - **逻辑（How）**：
///   1. 拒绝重复安装，以及外部已经设置过全局订阅者的情况；
///   2. 过滤规则优先取 `RUST_LOG`，缺省为 `info`；
///   3. 组装 `registry + EnvFilter + fmt` 并设为全局默认；
/// - **契约（What）**：重复调用返回 [`ObservabilityError::AlreadyInstalled`]；外部已有订阅者时返回
///   [`ObservabilityError::SubscriberAlreadySet`]。
pub fn install() -> Result<(), ObservabilityError> {
    if INSTALLED.get().is_some() {
        return Err(ObservabilityError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(ObservabilityError::SubscriberAlreadySet);
    }

    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| ObservabilityError::SubscriberAlreadySet)?;

    INSTALLED
        .set(())
        .map_err(|_| ObservabilityError::AlreadyInstalled)
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
