//! 并发流上限的“扣分”准入策略。
//!
//! # 教案式说明
//! - **意图（Why）**：流被异常拆除（对端重置、本端取消）时，连接应暂时少通告一个并发流，
//!   直到对端确认收到新的上限为止；设置帧的收发是异步的，扣分需要在“已发送未确认”期间保持有效；
//! - **契约（What）**：
//!   - `advertise_value() == max(0, target - unacknowledged)` 在任意调用交错下恒成立；
//!   - `unacknowledged` 只会被 [`StreamAdmissionPolicy::ack`] 减少，且永不为负；
//!   - 在 `flush` 与 `ack` 之间新增的扣分留在 `new` 中，不会被这次确认抵消；
//! - **逻辑（How）**：三个计数器 `new ⊆ unacknowledged`、`sent ⊆ unacknowledged`，
//!   `flush` 把 `new` 并入 `sent`，`ack` 从 `unacknowledged` 中扣除 `sent`。
//! - **前置条件**：同一连接的设置轮次由单一写者串行驱动，本类型不做内部同步。

/// 单条连接的并发流准入策略。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamAdmissionPolicy {
    target: u32,
    new_demerits: u32,
    sent_demerits: u32,
    unacknowledged_demerits: u32,
}

impl StreamAdmissionPolicy {
    pub fn new(target: u32) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// 设置稳态通告值。
    pub fn set_target(&mut self, target: u32) {
        self.target = target;
    }

    /// 记录一次扣分：在下一次确认之前少通告一个并发流。
    pub fn add_demerit(&mut self) {
        self.new_demerits = self.new_demerits.saturating_add(1);
        self.unacknowledged_demerits = self.unacknowledged_demerits.saturating_add(1);
    }

    /// 新上限已写入设置帧并发出。
    pub fn flush(&mut self) {
        self.sent_demerits = self.sent_demerits.saturating_add(self.new_demerits);
        self.new_demerits = 0;
    }

    /// 对端确认了最近一次发出的设置。
    pub fn ack(&mut self) {
        debug_assert!(self.sent_demerits <= self.unacknowledged_demerits);
        self.unacknowledged_demerits = self
            .unacknowledged_demerits
            .saturating_sub(self.sent_demerits);
        self.sent_demerits = 0;
    }

    /// 当前应通告的并发流上限。
    pub fn advertise_value(&self) -> u32 {
        self.target.saturating_sub(self.unacknowledged_demerits)
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// 尚未随设置帧发出的扣分。
    pub fn new_demerits(&self) -> u32 {
        self.new_demerits
    }

    /// 已发出但尚未确认的扣分。
    pub fn sent_demerits(&self) -> u32 {
        self.sent_demerits
    }

    pub fn unacknowledged_demerits(&self) -> u32 {
        self.unacknowledged_demerits
    }
}
