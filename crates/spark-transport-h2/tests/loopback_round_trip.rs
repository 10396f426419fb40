//! 回环连接与调用引擎的联调测试。
//!
//! # 教案级导览
//! - **Why**：准入策略与头部热度计数只有被真实的调用链路驱动时才能验证其协作契约；
//! - **How**：通道的连接器换成 [`LoopbackConnector`]，调用批次经子通道到达回环连接，
//!   完成事件回到完成队列；
//! - **What**：覆盖回显往返、并发流上限下的准入等待与取消扣分、连接关闭时停放批次失败、
//!   流结束后的残留接收、关闭后的重连，以及（启用 `runtime-tokio` 时）在 Tokio 运行时上投递完成。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spark_rpc_core::{
    Channel, ChannelArgs, CompletionQueue, Deadline, Event, Metadata, OpBatch, Status,
    SubchannelIndex, SubchannelKey, Tag,
};
use spark_transport_h2::{H2Settings, LoopbackConnector};

fn channel(connector: &Arc<LoopbackConnector>) -> Channel {
    Channel::builder(SubchannelKey::new("127.0.0.1:50051", ChannelArgs::new()))
        .index(SubchannelIndex::new())
        .connector(connector.clone())
        .build()
}

fn full_exchange(tag: u64, payload: &'static [u8]) -> OpBatch {
    OpBatch::new(Tag::new(tag))
        .send_initial_metadata(Metadata::new().with("content-type", "application/grpc"))
        .send_message(Bytes::from_static(payload))
        .send_close_from_client()
        .recv_initial_metadata()
        .recv_message()
}

/// ## 测试一：回显往返
///
/// - **意图 (Why)**：验证发送的元数据与消息被原样回显，终止批次得到 `Ok` 状态；
/// - **契约 (What)**：两个批次各产生一次成功事件，流在终止后释放。
#[test]
fn echo_round_trip_completes_with_ok() {
    let connector = Arc::new(LoopbackConnector::new(H2Settings::default()));
    let cq = CompletionQueue::new();
    let call = channel(&connector).create_call(&cq);

    call.submit(full_exchange(1, b"ping")).expect("交换批次");
    call.submit(OpBatch::new(Tag::new(2)).recv_status_on_client())
        .expect("终止批次");

    assert_eq!(
        cq.pluck(Tag::new(1), Deadline::after(Duration::from_secs(5))),
        Event::Complete { tag: Tag::new(1), success: true }
    );
    assert_eq!(
        cq.pluck(Tag::new(2), Deadline::after(Duration::from_secs(5))),
        Event::Complete { tag: Tag::new(2), success: true }
    );
    let metadata = call.take_initial_metadata().expect("回显的元数据");
    assert_eq!(
        metadata.get("content-type"),
        Some(&Bytes::from_static(b"application/grpc"))
    );
    assert_eq!(call.take_message(), Some(Bytes::from_static(b"ping")));
    assert_eq!(call.final_status(), Some(Status::ok()));

    let connection = connector.last_connection().expect("已建连");
    assert_eq!(connection.active_streams(), 0, "终止后流被释放");
    let stats = connection.stats();
    assert_eq!(stats.admitted_streams, 1);
    assert_eq!(stats.indexed_headers + stats.literal_headers, 1);
}

/// ## 测试二：超出上限的流等待准入，取消扣分直到设置确认
///
/// - **逻辑 (How)**：上限为 1；调用 A 占住唯一的流，调用 B 停放等待；取消 A 之后扣一分，
///   通告值降为 0，B 仍需等待；设置轮次确认后通告值恢复为 1，B 获准入并完成。
#[test]
fn admission_waits_and_cancel_adds_a_demerit() {
    let connector = Arc::new(LoopbackConnector::new(H2Settings {
        max_concurrent_streams: 1,
        ..H2Settings::default()
    }));
    let channel = channel(&connector);
    let cq = CompletionQueue::new();

    let first = channel.create_call(&cq);
    first
        .submit(
            OpBatch::new(Tag::new(1))
                .send_initial_metadata(Metadata::new())
                .recv_status_on_client(),
        )
        .expect("A 的终止批次");
    let second = channel.create_call(&cq);
    second
        .submit(full_exchange(2, b"queued").recv_status_on_client())
        .expect("B 的完整批次");

    let connection = connector.last_connection().expect("两个调用共享同一连接");
    assert_eq!(connector.connections(), 1);
    assert_eq!(connection.active_streams(), 1);
    assert_eq!(connection.parked_batches(), 2, "A 等待状态，B 等待准入");
    assert_eq!(cq.next(Deadline::immediate()), Event::Timeout);

    assert!(first.cancel());
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(1), success: false }
    );
    assert_eq!(connection.advertised_streams(), 0, "扣分在确认前持续有效");
    assert_eq!(connection.parked_batches(), 1);

    assert_eq!(connection.flush_settings(), Some(0));
    connection.ack_settings();
    assert_eq!(connection.advertised_streams(), 1);
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(2), success: true }
    );
    assert_eq!(second.take_message(), Some(Bytes::from_static(b"queued")));
    assert_eq!(connection.stats().reset_streams, 1);
}

/// ## 测试三：连接关闭时停放的批次以失败完成
#[test]
fn closing_fails_parked_batches() {
    let connector = Arc::new(LoopbackConnector::new(H2Settings::default()));
    let cq = CompletionQueue::new();
    let call = channel(&connector).create_call(&cq);

    call.submit(OpBatch::new(Tag::new(7)).recv_message()).expect("接收批次");
    let connection = connector.last_connection().expect("已建连");
    assert_eq!(connection.parked_batches(), 1, "尚无消息可读");

    connection.close();
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(7), success: false }
    );
    assert_eq!(connection.parked_batches(), 0);
}

/// ## 测试四：握手完成之前批次在调用侧排队
#[test]
fn batches_wait_for_the_handshake() {
    let connector = Arc::new(LoopbackConnector::new(H2Settings::default()).with_handshake());
    let cq = CompletionQueue::new();
    let call = channel(&connector).create_call(&cq);

    call.submit(full_exchange(3, b"early")).expect("握手前提交");
    assert_eq!(cq.next(Deadline::immediate()), Event::Timeout);

    let connection = connector.last_connection().expect("连接已创建");
    assert_eq!(connection.parked_batches(), 0, "批次仍停放在调用侧");
    connection.complete_handshake();
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(3), success: true }
    );
}

/// ## 测试五：流结束时同一调用仍在等待的接收以失败完成
///
/// - **意图 (Why)**：未发送初始元数据的调用无法回显元数据，状态到达后这条接收永远不会被满足；
/// - **契约 (What)**：终止批次成功，接收批次失败，连接不再残留停放批次，完成队列可以排空。
#[test]
fn finished_stream_fails_its_parked_receives() {
    let connector = Arc::new(LoopbackConnector::new(H2Settings::default()));
    let cq = CompletionQueue::new();
    let call = channel(&connector).create_call(&cq);

    call.submit(OpBatch::new(Tag::new(10)).recv_initial_metadata())
        .expect("接收批次");
    call.submit(
        OpBatch::new(Tag::new(11))
            .send_close_from_client()
            .recv_status_on_client(),
    )
    .expect("终止批次");

    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(11), success: true }
    );
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(10), success: false }
    );
    let connection = connector.last_connection().expect("已建连");
    assert_eq!(connection.parked_batches(), 0);
    assert_eq!(connection.active_streams(), 0);

    drop(call);
    cq.shutdown();
    assert_eq!(
        cq.pluck(Tag::new(10), Deadline::after(Duration::from_millis(500))),
        Event::Shutdown
    );
}

/// ## 测试六：握手期间关闭连接，调用侧排队的批次以失败完成
#[test]
fn closing_during_handshake_fails_waiting_batches() {
    let connector = Arc::new(LoopbackConnector::new(H2Settings::default()).with_handshake());
    let cq = CompletionQueue::new();
    let call = channel(&connector).create_call(&cq);

    call.submit(full_exchange(4, b"never")).expect("握手前提交");
    connector.last_connection().expect("连接已创建").close();

    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(4), success: false }
    );
    assert_eq!(cq.next(Deadline::immediate()), Event::Timeout, "恰好一次完成");
}

/// ## 测试七：连接关闭后，同一通道上的新调用在新连接上完成
///
/// - **逻辑 (How)**：首个调用完成后保留其句柄，让子通道继续存活；关闭连接后第二个调用
///   必须触发重连，而不是挂在已关闭连接的就绪回调上。
#[test]
fn new_calls_reconnect_after_close() {
    let connector = Arc::new(LoopbackConnector::new(H2Settings::default()));
    let channel = channel(&connector);
    let cq = CompletionQueue::new();

    let warm = channel.create_call(&cq);
    warm.submit(full_exchange(1, b"warm").recv_status_on_client())
        .expect("首个调用");
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(1), success: true }
    );
    let first = connector.last_connection().expect("已建连");
    first.close();

    let call = channel.create_call(&cq);
    call.submit(full_exchange(2, b"again").recv_status_on_client())
        .expect("第二个调用");
    assert_eq!(
        cq.pluck(Tag::new(2), Deadline::after(Duration::from_secs(1))),
        Event::Complete { tag: Tag::new(2), success: true }
    );
    assert_eq!(connector.connections(), 2, "关闭的连接被替换");
    assert_eq!(call.take_message(), Some(Bytes::from_static(b"again")));
    assert_eq!(first.stats().admitted_streams, 1);
}

/// ## 测试八：完成回调投递到 Tokio 运行时
#[cfg(feature = "runtime-tokio")]
#[test]
fn completions_run_on_the_tokio_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()
        .expect("构建 Tokio 运行时");
    let connector =
        Arc::new(LoopbackConnector::new(H2Settings::default()).with_runtime(runtime.handle().clone()));
    let cq = CompletionQueue::new();
    let call = channel(&connector).create_call(&cq);

    call.submit(full_exchange(11, b"async").recv_status_on_client())
        .expect("完整批次");
    assert_eq!(
        cq.pluck(Tag::new(11), Deadline::after(Duration::from_secs(5))),
        Event::Complete { tag: Tag::new(11), success: true }
    );
    assert_eq!(call.take_message(), Some(Bytes::from_static(b"async")));
}
