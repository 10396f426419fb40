//! 连接级设置与设置轮次跟踪。
//!
//! ### 设计目的（Why）
//! - [`H2Settings`] 把并发流目标值与解码端表空间预算集中到可序列化结构，部署侧以 TOML 覆盖；
//! - [`SettingsTracker`] 把准入策略与“发送设置 → 等待确认”的轮次协议绑定在一起，
//!   连接实现只需在三个时机调用它：流被重置、准备写设置帧、收到设置确认。
//!
//! ### 契约说明（What）
//! - 默认值：`max_concurrent_streams = 100`，`max_decoder_space_usage = 512`；
//! - `poll_settings` 只在通告值变化或有未发出的扣分时返回 `Some`，并同时完成 `flush`。

use serde::Deserialize;
use tracing::debug;

use crate::admission::StreamAdmissionPolicy;
use crate::error::SettingsError;

pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;
pub const DEFAULT_MAX_DECODER_SPACE_USAGE: usize = 512;

/// 单个表项的固定开销（名称与值之外）。
pub const ENTRY_OVERHEAD: usize = 32;

/// 连接级设置。
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct H2Settings {
    /// 稳态通告的并发流上限。
    pub max_concurrent_streams: u32,
    /// 单个表项允许占用的解码端空间上限（字节，不含）。
    pub max_decoder_space_usage: usize,
}

impl Default for H2Settings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            max_decoder_space_usage: DEFAULT_MAX_DECODER_SPACE_USAGE,
        }
    }
}

impl H2Settings {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: H2Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_decoder_space_usage <= ENTRY_OVERHEAD {
            return Err(SettingsError::Invalid {
                field: "max_decoder_space_usage",
                reason: format!("must exceed the {ENTRY_OVERHEAD}-byte entry overhead"),
            });
        }
        Ok(())
    }
}

/// 设置轮次跟踪器。
#[derive(Clone, Debug)]
pub struct SettingsTracker {
    policy: StreamAdmissionPolicy,
    last_sent: Option<u32>,
}

impl SettingsTracker {
    pub fn new(settings: &H2Settings) -> Self {
        Self {
            policy: StreamAdmissionPolicy::new(settings.max_concurrent_streams),
            last_sent: None,
        }
    }

    /// 流被异常拆除，扣一分。
    pub fn on_stream_reset(&mut self) {
        self.policy.add_demerit();
    }

    pub fn set_target(&mut self, target: u32) {
        self.policy.set_target(target);
    }

    /// 需要写出设置帧时返回要通告的值，并把待发扣分标记为已发送。
    pub fn poll_settings(&mut self) -> Option<u32> {
        let value = self.policy.advertise_value();
        if self.policy.new_demerits() == 0 && self.last_sent == Some(value) {
            return None;
        }
        self.policy.flush();
        self.last_sent = Some(value);
        debug!(max_concurrent_streams = value, "settings flushed");
        Some(value)
    }

    /// 对端确认了最近一次设置帧。
    pub fn on_settings_ack(&mut self) {
        self.policy.ack();
        debug!(
            advertised = self.policy.advertise_value(),
            "settings acknowledged"
        );
    }

    /// 当前允许的并发流上限。
    pub fn advertised(&self) -> u32 {
        self.policy.advertise_value()
    }

    pub fn policy(&self) -> &StreamAdmissionPolicy {
        &self.policy
    }
}
