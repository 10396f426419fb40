//! 调用引擎端到端测试：调用创建、子通道绑定、批次下发与完成路由。
//!
//! # 教案级导览
//! - **Why**：调用引擎把子通道索引、传输能力、完成队列串成一条链路，单元测试无法覆盖它们之间的协作；
//! - **How**：以 `test_stubs` 中的手动传输替身精确控制“何时完成、以何种结果完成”；
//! - **What**：覆盖端到端成功路径、结果交付、句柄丢弃即失败、关闭排空等场景。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use spark_rpc_core::test_stubs::ManualConnector;
use spark_rpc_core::{
    BatchResult, CallState, Channel, ChannelArgs, CompletionQueue, Deadline, Event, Metadata,
    OpBatch, Status, StatusCode, Subchannel, SubchannelIndex, SubchannelKey, Tag,
    config::BackoffConfig, transport::AllowAll,
};

fn target() -> SubchannelKey {
    SubchannelKey::new("10.0.0.1:443", ChannelArgs::new())
}

fn channel(index: &SubchannelIndex, connector: &Arc<ManualConnector>) -> Channel {
    Channel::builder(target())
        .index(index.clone())
        .connector(connector.clone())
        .build()
}

/// ## 测试一：端到端成功路径
///
/// - **意图 (Why)**：验证“创建调用 → 绑定新子通道 → 提交批次 → pluck 得到成功事件”的主链路；
/// - **逻辑 (How)**：传输在另一线程上完成批次，主线程以 5 秒截止时间 pluck；
///   调用存活期间再次注册同一键，必须得到同一子通道且引用计数 ≥ 2。
#[test]
fn end_to_end_pluck_returns_success() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let channel = channel(&index, &connector);
    let cq = CompletionQueue::new();
    let call = channel.create_call(&cq);

    let tag = Tag::new(0x7);
    call.submit(
        OpBatch::new(tag)
            .send_initial_metadata(Metadata::new().with("content-type", "application/grpc"))
            .send_message(Bytes::from_static(b"hello")),
    )
    .expect("批次应被接受");
    assert_eq!(call.state(), CallState::OpsInFlight);

    let transport = connector.last_transport().expect("首个批次应触发建连");
    let completer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        transport.complete_next(BatchResult::success())
    });

    let event = cq.pluck(tag, Instant::now() + Duration::from_secs(5));
    assert_eq!(event, Event::Complete { tag, success: true });
    assert_eq!(completer.join().expect("完成线程不应 panic"), Some(tag));

    let again = index.register(
        target(),
        Subchannel::create(
            &index,
            target(),
            connector.clone(),
            &AllowAll,
            &BackoffConfig::default(),
        ),
    );
    assert!(again.ref_count() >= 2, "调用仍持有子通道引用");
    assert!(again.ptr_eq(&call.subchannel().expect("调用已绑定子通道")));
    assert_eq!(connector.attempts(), 1, "子通道被复用，不得重复建连");
}

/// ## 测试二：接收类结果交付给应用
#[test]
fn received_results_are_handed_to_the_application() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let cq = CompletionQueue::new();
    let call = channel(&index, &connector).create_call(&cq);

    call.submit(OpBatch::new(Tag::new(1)).recv_initial_metadata().recv_message())
        .expect("接收批次");
    call.submit(OpBatch::new(Tag::new(2)).recv_status_on_client())
        .expect("终止批次");
    let transport = connector.last_transport().expect("已建连");

    transport.complete_next(
        BatchResult::success()
            .with_initial_metadata(Metadata::new().with("x-peer", "echo"))
            .with_message(Bytes::from_static(b"pong")),
    );
    transport.complete_next(BatchResult::success().with_status(Status::ok()));

    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(1), success: true }
    );
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(2), success: true }
    );
    let metadata = call.take_initial_metadata().expect("初始元数据");
    assert_eq!(metadata.get("x-peer"), Some(&Bytes::from_static(b"echo")));
    assert_eq!(call.take_message(), Some(Bytes::from_static(b"pong")));
    assert_eq!(call.take_message(), None, "消息只能取走一次");
    assert_eq!(call.final_status(), Some(Status::ok()));
    assert_eq!(call.state(), CallState::Completed);
}

/// ## 测试三：传输丢弃完成句柄等价于失败
#[test]
fn dropped_completion_reports_failure() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let cq = CompletionQueue::new();
    let call = channel(&index, &connector).create_call(&cq);

    call.submit(OpBatch::new(Tag::new(9)).recv_status_on_client())
        .expect("终止批次");
    let transport = connector.last_transport().expect("已建连");
    drop(transport.take_batches());

    assert_eq!(
        cq.pluck(Tag::new(9), Deadline::after(Duration::from_secs(1))),
        Event::Complete { tag: Tag::new(9), success: false }
    );
    let status = call.final_status().expect("失败的终止批次也产生状态");
    assert_eq!(status.code(), StatusCode::Unavailable);
}

/// ## 测试四：关闭后在途批次仍然投递，排空后报告关闭
///
/// - **契约 (What)**：`shutdown` 之前接受的批次在之后完成，`next` 先交付它们，再永久返回 `Shutdown`。
#[test]
fn shutdown_drains_in_flight_batches() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let cq = CompletionQueue::new();
    let call = channel(&index, &connector).create_call(&cq);

    call.submit(OpBatch::new(Tag::new(1)).send_message(Bytes::from_static(b"a")))
        .expect("提交");
    call.submit(OpBatch::new(Tag::new(2)).recv_message()).expect("提交");
    cq.shutdown();
    cq.shutdown();

    let transport = connector.last_transport().expect("已建连");
    let waiter = {
        let cq = cq.clone();
        thread::spawn(move || {
            let mut tags = Vec::new();
            loop {
                match cq.next(Deadline::after(Duration::from_secs(5))) {
                    Event::Complete { tag, .. } => tags.push(tag.value()),
                    Event::Shutdown => return tags,
                    Event::Timeout => panic!("排空前不应超时"),
                }
            }
        })
    };
    assert_eq!(transport.complete_all(true), 2);

    let mut drained = waiter.join().expect("排空线程不应 panic");
    drained.sort_unstable();
    assert_eq!(drained, vec![1, 2]);
    assert_eq!(cq.next(Deadline::none()), Event::Shutdown);
    assert_eq!(cq.pluck(Tag::new(1), Deadline::none()), Event::Shutdown);
}

/// ## 测试五：向已关闭队列提交是编程错误
#[test]
#[should_panic(expected = "shut down")]
fn submit_after_shutdown_panics() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let cq = CompletionQueue::new();
    let call = channel(&index, &connector).create_call(&cq);
    cq.shutdown();
    let _ = call.submit(OpBatch::new(Tag::new(1)).recv_message());
}

/// ## 测试六：丢弃未完成的调用句柄会取消调用
#[test]
fn dropping_an_unfinished_call_cancels_it() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let cq = CompletionQueue::new();
    let call = channel(&index, &connector).create_call(&cq);
    let call_id = call.id();
    call.submit(OpBatch::new(Tag::new(3)).recv_message()).expect("提交");
    drop(call);

    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(3), success: false }
    );
    let transport = connector.last_transport().expect("已建连");
    assert_eq!(transport.cancelled_calls(), vec![call_id]);
    transport.complete_all(true);
    assert_eq!(cq.next(Deadline::immediate()), Event::Timeout);
}

/// ## 测试七：终止批次先完成时，其余在途批次以失败结算
///
/// - **意图 (Why)**：状态到达后调用不再有任何结果可交付，仍在传输里等待的批次必须各自收到一次失败，
///   否则它们的 tag 永远不会出现在完成队列上，队列也无法排空；
/// - **契约 (What)**：终止批次成功、先前的接收批次失败，传输收到取消通知，之后的迟到完成被忽略。
#[test]
fn terminal_completion_fails_batches_still_in_flight() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let cq = CompletionQueue::new();
    let call = channel(&index, &connector).create_call(&cq);

    call.submit(OpBatch::new(Tag::new(10)).recv_initial_metadata())
        .expect("接收批次");
    call.submit(
        OpBatch::new(Tag::new(11))
            .send_close_from_client()
            .recv_status_on_client(),
    )
    .expect("终止批次");
    let transport = connector.last_transport().expect("已建连");
    let mut batches = transport.take_batches();
    let terminal = batches.pop().expect("终止批次已下发");
    let (_, completion) = terminal.into_parts();
    completion.complete(BatchResult::success().with_status(Status::ok()));

    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(11), success: true }
    );
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(10), success: false }
    );
    assert_eq!(call.state(), CallState::Completed);
    assert_eq!(transport.cancelled_calls(), vec![call.id()]);

    for batch in batches {
        let (_, completion) = batch.into_parts();
        completion.complete(BatchResult::success());
    }
    assert_eq!(cq.next(Deadline::immediate()), Event::Timeout, "迟到的完成不得重复投递");
    drop(call);
    cq.shutdown();
    assert_eq!(
        cq.pluck(Tag::new(10), Deadline::after(Duration::from_millis(500))),
        Event::Shutdown
    );
}

/// ## 测试八：传输关闭后，同一子通道上的新调用触发重连
///
/// - **逻辑 (How)**：首个调用完成后关闭其传输并保留调用句柄，让子通道继续存活；
///   第二个调用拿到的必须是新建立的传输，而不是挂在已关闭传输的就绪回调上。
#[test]
fn closed_transport_is_replaced_on_next_call() {
    let index = SubchannelIndex::new();
    let connector = Arc::new(ManualConnector::new());
    let channel = channel(&index, &connector);
    let cq = CompletionQueue::new();

    let warm = channel.create_call(&cq);
    warm.submit(OpBatch::new(Tag::new(1)).recv_status_on_client())
        .expect("首个调用");
    let first = connector.last_transport().expect("已建连");
    first.complete_next(BatchResult::success().with_status(Status::ok()));
    assert_eq!(
        cq.next(Deadline::immediate()),
        Event::Complete { tag: Tag::new(1), success: true }
    );
    first.close();

    let call = channel.create_call(&cq);
    call.submit(OpBatch::new(Tag::new(2)).recv_message())
        .expect("第二个调用");
    assert_eq!(call.state(), CallState::OpsInFlight, "不得停在等待连接状态");
    assert_eq!(connector.attempts(), 2, "关闭的传输被丢弃并重连");
    let subchannel = call.subchannel().expect("已绑定子通道");
    assert!(subchannel.ptr_eq(&warm.subchannel().expect("首个调用的子通道")));

    let second = connector.last_transport().expect("新传输");
    assert_eq!(second.complete_next(BatchResult::success()), Some(Tag::new(2)));
    assert_eq!(
        cq.pluck(Tag::new(2), Deadline::after(Duration::from_secs(1))),
        Event::Complete { tag: Tag::new(2), success: true }
    );
}
