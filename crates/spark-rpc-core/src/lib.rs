#![doc = r#"
# spark-rpc-core

## 设计动机（Why）
- **定位**：RPC 传输运行时的核心，负责异步调用/完成引擎：应用以批次提交非阻塞的
  发送/接收操作，引擎把批次送上共享的物理连接，再通过完成队列以不透明 tag 回报结果。
- **架构角色**：帧编解码、TLS、I/O 轮询都位于 [`Transport`] 能力之后；名称解析与负载均衡
  只负责提供 [`SubchannelKey`]。本 crate 只关心并发与资源生命周期契约。

## 核心契约（What）
- 每个被接受的批次恰好产生一次完成事件，失败以 `success=false` 表达；
- [`CompletionQueue::shutdown`] 之后不再接受新批次，已接受批次仍会投递，排空之后才报告关闭；
- 同一 `(地址, 参数)` 至多存在一个存活 [`Subchannel`]，由 [`SubchannelIndex`] 以写时复制快照去重；
- 调用级 [`Arena`] 只整体释放，分配可跨线程并发且永不失败；
- 编程错误（向已关闭队列提交、重复完成 tag、初始化前访问全局索引）记录 `error!` 后 panic。

## 实现策略（How）
- 完成队列：互斥锁 + 条件变量，待决计数器以 1 起步、仅非零时自增；
- 子通道索引：`arc-swap` 根指针上的 CAS 重试循环，条目为弱引用；
- Arena：`fetch_add` 游标 + CAS 链接的 Zone 链表；
- 批次结算：原子闩锁在“传输完成”与“取消”之间只选出一个胜者。

## 风险与考量（Trade-offs）
- 传输能力的 `send` 是同步接口，异步传输需自行把完成回调调度到合适的执行器；
- 连接尝试在子通道状态锁内同步执行，连接器不得回调同一子通道。
"#]
#![deny(unsafe_code)]

pub mod arena;
pub mod call;
pub mod channel;
pub mod completion_queue;
pub mod config;
pub mod error;
pub mod observability;
pub mod status;
pub mod subchannel;
pub mod test_stubs;
pub mod time;
pub mod transport;

mod sync;

pub use arena::{Arena, ArenaSlot};
pub use call::{
    BatchCompletion, BatchResult, Call, CallId, CallState, Metadata, Op, OpBatch, OpKind,
};
pub use channel::{CallSizeEstimator, Channel, ChannelBuilder};
pub use completion_queue::{CompletionQueue, Event, Tag};
pub use config::RuntimeConfig;
pub use error::{CallError, ConfigError, ConnectError};
pub use status::{Status, StatusCode};
pub use subchannel::index::SubchannelIndex;
pub use subchannel::key::{ArgValue, ChannelArgs, SubchannelKey};
pub use subchannel::{ConnectivityState, Subchannel, SubchannelHandle};
pub use time::Deadline;
pub use transport::{AllowAll, Authorizer, Connector, ReadyCallback, Transport, TransportBatch};
