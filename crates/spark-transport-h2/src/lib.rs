#![doc = r#"
# spark-transport-h2

## 设计动机（Why）
- **定位**：位于调用引擎之下的连接级组件：决定一条连接通告多少并发流、哪些头部值得进入
  压缩表，并提供一个内存回环连接把两者串进真实的调用链路。
- **架构角色**：实现 `spark-rpc-core` 的 [`spark_rpc_core::Transport`] 与
  [`spark_rpc_core::Connector`] 能力；帧字节布局与 TLS 不在本 crate 范围内。

## 核心契约（What）
- [`StreamAdmissionPolicy`]：`advertise_value == max(0, target - unacknowledged)`，扣分在对端确认之前持续有效；
- [`PopularityCount`]：任一计数器饱和时全部减半，热门判定为 `count >= 2 * sum / N`；
- [`LoopbackConnection`]：每个批次恰好完成一次，关闭时停放批次全部以失败完成。

## 实现策略（How）
- 策略与计数器是无锁的纯数据结构，由连接在自身互斥锁内驱动；
- 回环连接在释放锁之后执行完成回调，可选地投递到 Tokio 运行时（`runtime-tokio` 特性）。
"#]
#![deny(unsafe_code)]

pub mod admission;
pub mod connection;
pub mod error;
pub mod header_table;
pub mod popularity;
pub mod settings;

pub use admission::StreamAdmissionPolicy;
pub use connection::{LoopbackConnection, LoopbackConnector, LoopbackStats};
pub use error::SettingsError;
pub use header_table::HeaderIndexer;
pub use popularity::PopularityCount;
pub use settings::{H2Settings, SettingsTracker};
