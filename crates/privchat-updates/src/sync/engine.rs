/// 更新同步引擎
///
/// `UpdatesEngine` 持有全部同步状态（全局 pts/qts/seq/date、乱序缓冲、
/// 各频道状态、所有定时器），本身不做任何 I/O：
/// - 需要发请求时放进发件箱，由驱动方取走执行
/// - 请求结果通过 `handle_response` 按 `RequestId` 送回
/// - 定时器只记录截止时间，驱动方在 `next_deadline()` 到期后调用 `on_timer()`
///
/// 所有入口都在同一个任务里串行调用，不需要加锁。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::UpdatesConfig;
use crate::error::{Result, UpdatesError};
use crate::store::EntityStore;
use crate::sync::channel_state::ChannelRegistry;
use crate::sync::difference::ChannelDifferenceReason;
use crate::sync::retry::RetryBackoff;
use crate::sync::seq_buffer::SeqBuffer;
use crate::sync::sequence_tracker::SequenceTracker;
use crate::timer::{earliest, Timer};
use crate::transport::{OutgoingRequest, RequestId, SyncRequest, SyncResponse};
use crate::types::{ChannelId, MsgRange, ServerState};
use crate::update::{Update, UpdatesBody};

/// 在途请求对应的处理分支
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingRequest {
    InitialState,
    GlobalDifference,
    ChannelDifference(ChannelId),
    ChannelRange(ChannelId, MsgRange),
    Ping,
}

/// 计数器快照，交给会话持久化层保存
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub state: ServerState,
    /// (频道, 频道 pts)，只包含已初始化的频道
    pub channels: Vec<(ChannelId, u64)>,
}

pub struct UpdatesEngine {
    pub(crate) config: UpdatesConfig,
    pub(crate) store: Arc<dyn EntityStore>,

    pub(crate) pts: SequenceTracker<Update>,
    pub(crate) qts: SequenceTracker<Update>,
    pub(crate) seq: u64,
    pub(crate) date: i64,
    /// 是否已拿到初始状态
    pub(crate) state_inited: bool,

    pub(crate) seq_buffer: SeqBuffer<UpdatesBody>,
    pub(crate) channels: ChannelRegistry,

    pub(crate) retry: RetryBackoff,
    pub(crate) retry_timer: Timer,
    /// 太久没有更新时发 ping
    pub(crate) no_updates_timer: Timer,
    /// 收到未知频道的消息后，宽限期过后拉全局 difference
    pub(crate) by_min_channel_timer: Timer,
    pub(crate) last_update: Option<Instant>,
    /// 正在喂频道 difference 的内容
    pub(crate) handling_channel_difference: bool,

    next_request_id: RequestId,
    pub(crate) pending: HashMap<RequestId, PendingRequest>,
    outbox: Vec<OutgoingRequest>,
}

impl UpdatesEngine {
    /// 创建引擎并立即请求初始状态
    pub fn new(config: UpdatesConfig, store: Arc<dyn EntityStore>) -> Result<Self> {
        config.validate()?;

        let mut pts = SequenceTracker::new(config.gap_grace());
        let mut qts = SequenceTracker::new(config.gap_grace());
        // 拿到初始状态前一直处于请求中
        pts.set_requesting(true);
        qts.set_requesting(true);

        let mut engine = Self {
            seq_buffer: SeqBuffer::new(config.gap_grace()),
            channels: ChannelRegistry::new(config.clone()),
            retry: RetryBackoff::new(config.retry_floor(), config.retry_ceiling()),
            retry_timer: Timer::new(),
            no_updates_timer: Timer::new(),
            by_min_channel_timer: Timer::new(),
            last_update: None,
            handling_channel_difference: false,
            pts,
            qts,
            seq: 0,
            date: 0,
            state_inited: false,
            next_request_id: 1,
            pending: HashMap::new(),
            outbox: Vec::new(),
            config,
            store,
        };
        engine.request_initial_state();
        Ok(engine)
    }

    pub fn config(&self) -> &UpdatesConfig {
        &self.config
    }

    /// 当前全局状态
    pub fn state(&self) -> ServerState {
        ServerState {
            pts: self.pts.current(),
            qts: self.qts.current(),
            seq: self.seq,
            date: self.date,
        }
    }

    pub fn is_state_inited(&self) -> bool {
        self.state_inited
    }

    /// 是否正在拉全局 difference（含初始状态）
    pub fn is_requesting_difference(&self) -> bool {
        self.pts.is_requesting()
    }

    pub fn channel_pts(&self, channel: ChannelId) -> Option<u64> {
        self.channels
            .get(channel)
            .filter(|state| state.tracker.is_inited())
            .map(|state| state.pts())
    }

    pub fn is_channel_requesting(&self, channel: ChannelId) -> bool {
        self.channels
            .get(channel)
            .map(|state| state.tracker.is_requesting())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let mut channels: Vec<(ChannelId, u64)> = self
            .channels
            .iter()
            .filter(|state| state.tracker.is_inited())
            .map(|state| (state.channel, state.pts()))
            .collect();
        channels.sort_unstable();
        SyncSnapshot {
            state: self.state(),
            channels,
        }
    }

    /// 取走待发送的请求
    pub fn take_outgoing(&mut self) -> Vec<OutgoingRequest> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn send(&mut self, request: SyncRequest, pending: PendingRequest) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        debug!("发出请求: request_id={}, route={}", id, request.route());
        self.pending.insert(id, pending);
        self.outbox.push(OutgoingRequest { id, request });
        id
    }

    /// 作废一个在途请求，之后到达的响应会被忽略
    pub(crate) fn forget_request(&mut self, id: RequestId) {
        if self.pending.remove(&id).is_some() {
            debug!("作废在途请求: request_id={}", id);
        }
        self.outbox.retain(|outgoing| outgoing.id != id);
    }

    pub(crate) fn request_initial_state(&mut self) {
        info!("请求初始同步状态");
        self.send(SyncRequest::InitialState, PendingRequest::InitialState);
    }

    /// 传输层通知新会话建立：seq 归零并强制拉全局 difference
    pub fn new_session_created(&mut self) {
        info!("新会话已建立，重置 seq 并拉取 difference");
        self.seq = 0;
        self.get_difference();
    }

    /// 请求结果
    pub fn handle_response(&mut self, id: RequestId, result: Result<SyncResponse>) {
        let Some(pending) = self.pending.remove(&id) else {
            debug!("忽略已作废请求的响应: request_id={}", id);
            return;
        };

        match pending {
            PendingRequest::InitialState => match result {
                Ok(SyncResponse::State(state)) => self.state_done(state),
                Ok(other) => self.state_fail(unexpected(&other, "state")),
                Err(e) => self.state_fail(e),
            },
            PendingRequest::GlobalDifference => match result {
                Ok(SyncResponse::Difference(difference)) => self.difference_done(difference),
                Ok(other) => self.difference_fail(unexpected(&other, "difference")),
                Err(e) => self.difference_fail(e),
            },
            PendingRequest::ChannelDifference(channel) => {
                if let Some(state) = self.channels.get_mut(channel) {
                    state.difference_request = None;
                }
                match result {
                    Ok(SyncResponse::ChannelDifference(difference)) => {
                        self.channel_difference_done(channel, difference)
                    }
                    Ok(other) => {
                        self.channel_difference_fail(channel, unexpected(&other, "channel_difference"))
                    }
                    Err(e) => self.channel_difference_fail(channel, e),
                }
            }
            PendingRequest::ChannelRange(channel, range) => {
                if let Some(state) = self.channels.get_mut(channel) {
                    state.range_request = None;
                }
                match result {
                    Ok(SyncResponse::ChannelDifference(difference)) => {
                        self.channel_range_difference_done(channel, range, difference)
                    }
                    Ok(other) => self.channel_range_difference_fail(
                        channel,
                        unexpected(&other, "channel_difference"),
                    ),
                    Err(e) => self.channel_range_difference_fail(channel, e),
                }
            }
            PendingRequest::Ping => {
                if let Err(e) = result {
                    warn!("ping 失败: {}", e);
                }
            }
        }
    }

    fn state_done(&mut self, state: ServerState) {
        info!(
            "✅ 初始状态: pts={}, qts={}, seq={}, date={}",
            state.pts, state.qts, state.seq, state.date
        );
        self.retry.reset();
        self.state_inited = true;
        self.set_state(state.pts, state.date, state.qts, state.seq);

        self.last_update = Some(Instant::now());
        self.no_updates_timer.call_once(self.config.no_updates_timeout());
        self.pts.set_requesting(false);
        self.qts.set_requesting(false);
    }

    fn state_fail(&mut self, error: UpdatesError) {
        let delay = self.retry.next_delay();
        warn!(
            "获取初始状态失败: {}, {}s 后重试（第 {} 次）",
            error,
            delay.as_secs(),
            self.retry.failures()
        );
        self.retry_timer.call_once(delay);
    }

    /// 采用服务器给出的状态
    ///
    /// 各参数为 0 表示不更新；seq 变化后会依次释放乱序缓冲里已经连续的批次。
    pub(crate) fn set_state(&mut self, pts: u64, date: i64, qts: u64, seq: u64) {
        if self.advance_state(pts, date, qts, seq) {
            self.drain_seq_buffer();
        }
    }

    /// 返回 seq 是否变化
    pub(crate) fn advance_state(&mut self, pts: u64, date: i64, qts: u64, seq: u64) -> bool {
        if pts != 0 {
            self.pts.init(pts);
        }
        if self.date < date && !self.by_min_channel_timer.is_active() {
            self.date = date;
        }
        if qts != 0 && (!self.qts.is_inited() || self.qts.current() < qts) {
            self.qts.init(qts);
        }
        if seq != 0 && seq != self.seq {
            self.seq = seq;
            self.seq_buffer.cancel_timer();
            return true;
        }
        false
    }

    fn drain_seq_buffer(&mut self) {
        while let Some(body) = self.seq_buffer.take_next(self.seq) {
            debug!("释放乱序批次: seq_start={}, seq={}", body.leading_seq(), body.seq);
            let date = body.date;
            let seq = body.seq;
            self.apply_updates_body(body.updates, &body.users, &body.chats);
            let qts = self.qts.current();
            self.advance_state(0, date, qts, seq);
        }
    }

    /// 最早的定时器截止时间
    pub fn next_deadline(&self) -> Option<Instant> {
        let global = earliest([
            self.pts.gap_timer().deadline(),
            self.qts.gap_timer().deadline(),
            self.seq_buffer.timer().deadline(),
            self.retry_timer.deadline(),
            self.no_updates_timer.deadline(),
            self.by_min_channel_timer.deadline(),
        ]);
        earliest(
            std::iter::once(global).chain(self.channels.iter().map(|state| state.next_deadline())),
        )
    }

    /// 处理所有已到期的定时器
    pub fn on_timer(&mut self) {
        let now = Instant::now();

        let pts_gap = self.pts.poll_gap(now);
        let qts_gap = self.qts.poll_gap(now);
        if pts_gap || qts_gap {
            warn!(
                "⚠️ 间隙在宽限期内未补齐，拉取 difference: pts={}, qts={}",
                self.pts.current(),
                self.qts.current()
            );
            self.get_difference();
        }

        if self.seq_buffer.poll(now) {
            warn!(
                "⚠️ 乱序批次等待超时，丢弃 {} 个批次并拉取 difference: seq={}",
                self.seq_buffer.len(),
                self.seq
            );
            self.seq_buffer.clear();
            self.get_difference();
        }

        if self.by_min_channel_timer.fire_if_due(now) {
            info!("收到过未知频道的消息，拉取 difference");
            self.get_difference();
        }

        if self.retry_timer.fire_if_due(now) {
            if self.state_inited {
                info!("🔄 difference 失败后重试");
                self.pts.set_requesting(false);
                self.qts.set_requesting(false);
                self.get_difference();
            } else {
                self.request_initial_state();
            }
        }

        if self.no_updates_timer.fire_if_due(now) {
            debug!("长时间没有收到更新，发送 ping");
            self.send(SyncRequest::Ping, PendingRequest::Ping);
        }

        let mut due = Vec::new();
        for state in self.channels.iter_mut() {
            let gap = state.tracker.poll_gap(now);
            let short_poll = state.short_poll.fire_if_due(now);
            if gap || short_poll {
                due.push((state.channel, ChannelDifferenceReason::GapOrShortPoll));
            }
            if state.retry_timer.fire_if_due(now) {
                state.tracker.set_requesting(false);
                due.push((state.channel, ChannelDifferenceReason::AfterFailure));
            }
        }
        for (channel, reason) in due {
            self.get_channel_difference(channel, reason);
        }
    }

    /// 检查距离上次收到更新是否太久（例如系统休眠唤醒后），太久就发 ping
    pub fn check_last_update(&mut self, after_sleep: bool) {
        let Some(last) = self.last_update else {
            return;
        };
        let skip = if after_sleep {
            self.config.no_updates_after_sleep_timeout()
        } else {
            self.config.no_updates_timeout()
        };
        let now = Instant::now();
        if now > last + skip {
            debug!("距上次更新已超过 {}s，发送 ping", skip.as_secs());
            self.last_update = Some(now);
            self.send(SyncRequest::Ping, PendingRequest::Ping);
        }
    }

    /// 设置频道是否正在被查看；活跃频道会被短轮询
    pub fn set_channel_active(&mut self, channel: ChannelId, active: bool) {
        let delay = self.channels.short_poll_delay();
        let state = self.channels.get_or_insert(channel);
        state.active = active;
        if active {
            state.short_poll.call_once(delay);
        } else {
            state.short_poll.cancel();
        }
    }

    /// 驱逐频道：丢弃其状态，在途请求的响应将被忽略
    pub fn evict_channel(&mut self, channel: ChannelId) {
        let Some(state) = self.channels.evict(channel) else {
            return;
        };
        debug!("驱逐频道: channel_id={}, pts={}", channel, state.pts());
        for id in [state.difference_request, state.range_request].into_iter().flatten() {
            self.forget_request(id);
        }
    }
}

fn unexpected(response: &SyncResponse, expected: &str) -> UpdatesError {
    UpdatesError::MalformedResponse(format!(
        "expected {}, got {}",
        expected,
        response.type_name()
    ))
}
