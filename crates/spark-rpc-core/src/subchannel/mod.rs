//! 子通道：按 `(地址, 参数)` 去重、被多个调用共享的逻辑连接。
//!
//! - [`key`]：去重键；
//! - [`index`]：进程级写时复制索引；
//! - [`backoff`]：重连退避；
//! - 本模块：连接状态机与共享句柄。

pub mod backoff;
pub mod index;
pub mod key;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::BackoffConfig;
use crate::error::ConnectError;
use crate::transport::{Authorizer, Connector, Transport};

use self::backoff::Backoff;
use self::index::{IndexShared, SubchannelIndex};
use self::key::SubchannelKey;

/// 子通道连接状态。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectivityState {
    /// 尚未尝试连接。
    Idle,
    /// 连接尝试进行中。
    Connecting,
    /// 传输已可用。
    Ready,
    /// 最近一次尝试失败，或鉴权未通过。
    TransientFailure,
    /// 已关闭，不再建立连接。
    Shutdown,
}

/// 被共享的逻辑连接。
///
/// # 教案式说明
/// - **意图（Why）**：把“鉴权一次、按需连接、失败退避、连接复用”集中在一个对象里，调用只需
///   请求传输能力；
/// - **契约（What）**：
///   - 鉴权信号在构造时消费一次，否定结论让子通道永久停留在 `TransientFailure`；
///   - [`Subchannel::transport`] 在 `Ready` 时直接返回已建立的传输，否则同步发起一次连接尝试；
///     已关闭的传输被丢弃，子通道回到 `Idle` 并立即重连；
///   - 退避窗口内的尝试立即以 [`ConnectError::BackingOff`] 失败；
///   - 最后一个句柄释放时从所属索引注销（仅当索引条目仍指向自己）；
/// - **注意事项（Trade-offs）**：连接尝试在状态锁内同步执行，同一子通道上的并发请求因此串行化，
///   换来“至多一次并发连接尝试”的简单保证；连接器实现不得回调同一子通道。
pub struct Subchannel {
    id: u64,
    key: SubchannelKey,
    authorized: bool,
    connector: Arc<dyn Connector>,
    min_connect_timeout: std::time::Duration,
    index: Weak<IndexShared>,
    connectivity: Mutex<Connectivity>,
}

struct Connectivity {
    state: ConnectivityState,
    transport: Option<Arc<dyn Transport>>,
    backoff: Backoff,
    next_attempt: Option<Instant>,
}

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl Subchannel {
    /// 构造子通道句柄；调用方随后应通过 [`SubchannelIndex::register`] 登记。
    pub fn create(
        index: &SubchannelIndex,
        key: SubchannelKey,
        connector: Arc<dyn Connector>,
        authorizer: &dyn Authorizer,
        backoff: &BackoffConfig,
    ) -> SubchannelHandle {
        let id = NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let authorized = authorizer.authorize(&key);
        let initial_state = if authorized {
            ConnectivityState::Idle
        } else {
            warn!(subchannel = %key, id, "subchannel authorization denied");
            ConnectivityState::TransientFailure
        };
        debug!(subchannel = %key, id, authorized, "subchannel created");
        SubchannelHandle::from_arc(Arc::new(Subchannel {
            id,
            key,
            authorized,
            connector,
            min_connect_timeout: backoff.min_connect_timeout(),
            index: index.downgrade(),
            connectivity: Mutex::new(Connectivity {
                state: initial_state,
                transport: None,
                backoff: Backoff::new(backoff.clone(), id),
                next_attempt: None,
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SubchannelKey {
        &self.key
    }

    pub fn state(&self) -> ConnectivityState {
        self.connectivity.lock().state
    }

    /// 获取可用传输；必要时发起一次连接尝试。
    pub fn transport(&self) -> Result<Arc<dyn Transport>, ConnectError> {
        let mut conn = self.connectivity.lock();
        match conn.state {
            ConnectivityState::Shutdown => return Err(ConnectError::Shutdown),
            ConnectivityState::Ready => match &conn.transport {
                Some(transport) if !transport.is_closed() => return Ok(Arc::clone(transport)),
                _ => {
                    info!(subchannel = %self.key, id = self.id, "transport closed; reconnecting");
                    conn.transport = None;
                    conn.state = ConnectivityState::Idle;
                }
            },
            _ => {}
        }
        if !self.authorized {
            conn.state = ConnectivityState::TransientFailure;
            return Err(ConnectError::Unauthorized {
                address: self.key.address_lossy(),
            });
        }
        let now = Instant::now();
        if let Some(next_attempt) = conn.next_attempt {
            if now < next_attempt {
                return Err(ConnectError::BackingOff {
                    remaining: next_attempt - now,
                });
            }
        }

        conn.state = ConnectivityState::Connecting;
        debug!(subchannel = %self.key, id = self.id, "connecting");
        match self.connector.connect(&self.key, self.min_connect_timeout) {
            Ok(transport) => {
                conn.state = ConnectivityState::Ready;
                conn.transport = Some(Arc::clone(&transport));
                conn.backoff.reset();
                conn.next_attempt = None;
                info!(subchannel = %self.key, id = self.id, "subchannel ready");
                Ok(transport)
            }
            Err(err) => {
                conn.state = ConnectivityState::TransientFailure;
                if err.retryable() {
                    let delay = conn.backoff.next_delay();
                    conn.next_attempt = Some(now + delay);
                    warn!(
                        subchannel = %self.key,
                        id = self.id,
                        code = err.code(),
                        retry_in = ?delay,
                        "connection attempt failed"
                    );
                } else {
                    warn!(
                        subchannel = %self.key,
                        id = self.id,
                        code = err.code(),
                        "connection attempt rejected"
                    );
                }
                Err(err)
            }
        }
    }

    /// 关闭子通道，丢弃已建立的传输。
    pub fn shutdown(&self) {
        let mut conn = self.connectivity.lock();
        if conn.state != ConnectivityState::Shutdown {
            conn.state = ConnectivityState::Shutdown;
            conn.transport = None;
            debug!(subchannel = %self.key, id = self.id, "subchannel shut down");
        }
    }
}

impl Drop for Subchannel {
    fn drop(&mut self) {
        if let Some(index) = self.index.upgrade() {
            index.unregister(&self.key, self as *const Subchannel);
        }
        debug!(subchannel = %self.key, id = self.id, "subchannel released");
    }
}

impl fmt::Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subchannel")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// 子通道的共享句柄；最后一个句柄释放时子通道注销并销毁。
#[derive(Clone, Debug)]
pub struct SubchannelHandle {
    inner: Arc<Subchannel>,
}

impl SubchannelHandle {
    pub(crate) fn from_arc(inner: Arc<Subchannel>) -> Self {
        Self { inner }
    }

    /// 当前存活的句柄数量（含本句柄）。
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 两个句柄是否指向同一子通道。
    pub fn ptr_eq(&self, other: &SubchannelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<Subchannel> {
        Arc::downgrade(&self.inner)
    }
}

impl Deref for SubchannelHandle {
    type Target = Subchannel;

    fn deref(&self) -> &Subchannel {
        &self.inner
    }
}
