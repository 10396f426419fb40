//! 原子类型切换层。
//!
//! 启用 `--cfg loom`（或 `--cfg spark_loom`）时切换到 Loom 提供的原子类型，使模型检查能够
//! 穷举 Arena 链接新 Zone、批次完成闩锁等路径上的调度交错；常规构建直接使用标准库实现。

#[cfg(not(any(loom, spark_loom)))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
