//! 更新同步服务
//!
//! 把同步引擎放进一个独立的 tokio 任务里驱动：
//! - 入站事件（推送批次、新会话、频道活跃状态……）经 mpsc 队列进入
//! - 引擎发件箱里的请求各自 spawn 一个任务交给传输层，结果经内部通道送回
//! - 睡眠到引擎最早的定时器截止时间后调用 `on_timer`
//!
//! 引擎状态只在这个任务里被访问，外部通过 `UpdatesHandle` 交互。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UpdatesConfig;
use crate::error::{Result, UpdatesError};
use crate::store::EntityStore;
use crate::sync::engine::{SyncSnapshot, UpdatesEngine};
use crate::transport::{self, RequestId, SyncResponse, UpdatesTransport};
use crate::types::ChannelId;
use crate::update::UpdatesBatch;

/// 入站事件
#[derive(Debug)]
pub enum InboundEvent {
    Updates(UpdatesBatch),
    NewSessionCreated,
    ChannelActive { channel: ChannelId, active: bool },
    EvictChannel(ChannelId),
    CheckLastUpdate { after_sleep: bool },
    Snapshot(oneshot::Sender<SyncSnapshot>),
}

type ResponseMessage = (RequestId, Result<SyncResponse>);

/// 服务句柄，可克隆
#[derive(Clone)]
pub struct UpdatesHandle {
    sender: mpsc::Sender<InboundEvent>,
    shutdown: CancellationToken,
}

impl UpdatesHandle {
    async fn send(&self, event: InboundEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| UpdatesError::ShuttingDown("更新同步服务已停止".to_string()))
    }

    /// 投递传输层收到的更新
    pub async fn feed(&self, batch: UpdatesBatch) -> Result<()> {
        self.send(InboundEvent::Updates(batch)).await
    }

    pub async fn new_session_created(&self) -> Result<()> {
        self.send(InboundEvent::NewSessionCreated).await
    }

    pub async fn set_channel_active(&self, channel: ChannelId, active: bool) -> Result<()> {
        self.send(InboundEvent::ChannelActive { channel, active }).await
    }

    pub async fn evict_channel(&self, channel: ChannelId) -> Result<()> {
        self.send(InboundEvent::EvictChannel(channel)).await
    }

    /// 应用回到前台 / 系统唤醒时调用
    pub async fn check_last_update(&self, after_sleep: bool) -> Result<()> {
        self.send(InboundEvent::CheckLastUpdate { after_sleep }).await
    }

    /// 当前计数器快照
    pub async fn snapshot(&self) -> Result<SyncSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(InboundEvent::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| UpdatesError::ShuttingDown("更新同步服务已停止".to_string()))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// 更新同步服务
pub struct UpdatesService {
    handle: UpdatesHandle,
    task: JoinHandle<()>,
}

impl UpdatesService {
    /// 创建引擎并启动驱动任务，必须在 tokio 运行时内调用
    pub fn spawn(
        config: UpdatesConfig,
        transport: Arc<dyn UpdatesTransport>,
        store: Arc<dyn EntityStore>,
    ) -> Result<Self> {
        let queue_size = config.inbound_queue_size;
        let engine = UpdatesEngine::new(config, store)?;
        let (sender, receiver) = mpsc::channel(queue_size);
        let shutdown = CancellationToken::new();

        let driver = Driver {
            engine,
            transport,
            inbound: receiver,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(driver.run());
        info!("✅ 更新同步服务已启动");

        Ok(Self {
            handle: UpdatesHandle { sender, shutdown },
            task,
        })
    }

    pub fn handle(&self) -> UpdatesHandle {
        self.handle.clone()
    }

    /// 停止服务并等待驱动任务退出
    pub async fn shutdown(self) {
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            warn!("更新同步任务异常退出: {}", e);
        }
        info!("更新同步服务已停止");
    }
}

struct Driver {
    engine: UpdatesEngine,
    transport: Arc<dyn UpdatesTransport>,
    inbound: mpsc::Receiver<InboundEvent>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ResponseMessage>();

        loop {
            self.dispatch_outgoing(&response_tx);
            let deadline = self.engine.next_deadline();

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("更新同步任务收到停止信号");
                    break;
                }
                event = self.inbound.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("所有句柄已释放，更新同步任务退出");
                        break;
                    }
                },
                Some((id, result)) = response_rx.recv() => {
                    self.engine.handle_response(id, result);
                }
                _ = sleep_until(deadline) => {
                    self.engine.on_timer();
                }
            }
        }
    }

    fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Updates(batch) => self.engine.receive_updates(batch),
            InboundEvent::NewSessionCreated => self.engine.new_session_created(),
            InboundEvent::ChannelActive { channel, active } => {
                self.engine.set_channel_active(channel, active)
            }
            InboundEvent::EvictChannel(channel) => self.engine.evict_channel(channel),
            InboundEvent::CheckLastUpdate { after_sleep } => {
                self.engine.check_last_update(after_sleep)
            }
            InboundEvent::Snapshot(reply) => {
                // 调用方可能已经放弃等待
                let _ = reply.send(self.engine.snapshot());
            }
        }
    }

    fn dispatch_outgoing(&mut self, response_tx: &mpsc::UnboundedSender<ResponseMessage>) {
        for outgoing in self.engine.take_outgoing() {
            let transport = self.transport.clone();
            let response_tx = response_tx.clone();
            let shutdown = self.shutdown.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = transport::execute(transport.as_ref(), outgoing.request) => {
                        let _ = response_tx.send((outgoing.id, result));
                    }
                }
            });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_support::RecordingStore;
    use crate::types::{ChannelDifference, Difference, DifferenceContents, MsgRange, PtsCount, ServerState};
    use crate::update::Update;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        difference_calls: Mutex<Vec<(u64, i64, u64)>>,
    }

    #[async_trait]
    impl UpdatesTransport for MockTransport {
        async fn get_state(&self) -> Result<ServerState> {
            Ok(ServerState { pts: 100, qts: 5, seq: 1, date: 1000 })
        }

        async fn get_difference(&self, pts: u64, date: i64, qts: u64) -> Result<Difference> {
            self.difference_calls.lock().push((pts, date, qts));
            Ok(Difference::Full {
                contents: DifferenceContents {
                    other_updates: vec![delete(101), delete(102)],
                    ..Default::default()
                },
                state: ServerState { pts: 102, qts: 5, seq: 2, date: 1002 },
            })
        }

        async fn get_channel_difference(
            &self,
            _channel: ChannelId,
            pts: u64,
            _limit: u32,
            _force: bool,
        ) -> Result<ChannelDifference> {
            Ok(ChannelDifference::Empty { pts, is_final: true, timeout: None })
        }

        async fn get_channel_range_difference(
            &self,
            _channel: ChannelId,
            pts: u64,
            _range: MsgRange,
            _limit: u32,
        ) -> Result<ChannelDifference> {
            Ok(ChannelDifference::Empty { pts, is_final: true, timeout: None })
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn delete(pts: u64) -> Update {
        Update::DeleteMessages {
            ids: vec![pts as i64],
            pts: PtsCount::new(pts, 1),
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    async fn wait_for_pts(handle: &UpdatesHandle, pts: u64) -> SyncSnapshot {
        for _ in 0..1000 {
            let snapshot = handle.snapshot().await.unwrap();
            if snapshot.state.pts == pts {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pts never reached {}", pts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_recovers_gap() {
        init_tracing();
        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(RecordingStore::new());
        let service =
            UpdatesService::spawn(UpdatesConfig::default(), transport.clone(), store.clone()).unwrap();
        let handle = service.handle();

        wait_for_pts(&handle, 100).await;
        tokio_test::assert_ok!(
            handle
                .feed(UpdatesBatch::Short { update: delete(102), date: 1001 })
                .await
        );

        let snapshot = wait_for_pts(&handle, 102).await;
        assert_eq!(snapshot.state.seq, 2);
        assert_eq!(*transport.difference_calls.lock(), vec![(100, 1001, 5)]);
        assert_eq!(store.applied_updates(), vec![delete(101), delete(102)]);

        service.shutdown().await;
        assert!(handle.is_shutdown());
        tokio_test::assert_err!(handle.snapshot().await);
    }

    #[tokio::test]
    async fn test_service_applies_in_order_updates() {
        let transport = Arc::new(MockTransport::default());
        let store = Arc::new(RecordingStore::new());
        let service =
            UpdatesService::spawn(UpdatesConfig::default(), transport.clone(), store.clone()).unwrap();
        let handle = service.handle();

        wait_for_pts(&handle, 100).await;
        handle
            .feed(UpdatesBatch::Short { update: delete(101), date: 1001 })
            .await
            .unwrap();
        let snapshot = wait_for_pts(&handle, 101).await;
        assert_eq!(snapshot.state.date, 1001);
        assert!(transport.difference_calls.lock().is_empty());

        service.shutdown().await;
    }
}
