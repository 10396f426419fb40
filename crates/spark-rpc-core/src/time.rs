use std::time::{Duration, Instant};

/// 阻塞等待的截止时间。
///
/// # 契约说明（What）
/// - `Deadline::none()` 表示无限等待；
/// - 其余构造方式都基于单调时钟 [`Instant`]，不受系统时间回拨影响；
/// - 已过期的截止时间会让 `next`/`pluck` 在没有可用事件时立即返回超时。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 不设截止时间。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 以绝对时间点构造。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以“当前时刻 + 持续时间”构造。
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self::at(now.checked_add(timeout).unwrap_or(now + Duration::from_secs(86_400 * 365)))
    }

    /// 立即过期，常用于非阻塞轮询。
    pub fn immediate() -> Self {
        Self::at(Instant::now())
    }

    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 判断是否已经超时。
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.instant {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::none()
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline::at(instant)
    }
}
