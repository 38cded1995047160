/// difference 拉取
///
/// 全局与频道各一套状态机，形状相同：
/// 空闲 → 请求中 → 空闲（成功；未拉完则立即再拉）/ 空闲（失败，退避后重试）
///
/// 同一作用域同时最多一个在途请求，由追踪器的 requesting 标记保证。

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::UpdatesError;
use crate::store::MessageKind;
use crate::sync::engine::{PendingRequest, UpdatesEngine};
use crate::transport::SyncRequest;
use crate::types::{ChannelDifference, ChannelId, ChatEntity, Difference, DifferenceContents, Message, UserEntity};
use crate::update::{SkipUpdatePolicy, Update};

/// 频道 difference 的触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDifferenceReason {
    /// 间隙宽限期到期或短轮询
    GapOrShortPoll,
    /// 上次失败后的退避重试
    AfterFailure,
    /// 其它显式触发（例如 channel too long、未拉完时继续拉取）
    Explicit,
}

impl UpdatesEngine {
    /// 拉取全局 difference
    pub fn get_difference(&mut self) {
        self.pts.cancel_gap_timer();
        self.qts.cancel_gap_timer();

        if self.is_requesting_difference() {
            return;
        }

        self.seq_buffer.clear();
        self.no_updates_timer.cancel();
        self.retry_timer.cancel();

        self.pts.set_requesting(true);
        self.qts.set_requesting(true);

        let request = SyncRequest::GlobalDifference {
            pts: self.pts.current(),
            date: self.date,
            qts: self.qts.current(),
        };
        info!(
            "🔄 拉取 difference: pts={}, date={}, qts={}",
            self.pts.current(),
            self.date,
            self.qts.current()
        );
        self.send(request, PendingRequest::GlobalDifference);
    }

    pub(crate) fn difference_done(&mut self, difference: Difference) {
        match difference {
            Difference::Empty { date, seq } => {
                self.retry.reset();
                info!("✅ difference 为空: date={}, seq={}", date, seq);
                let pts = self.pts.current();
                let qts = self.qts.current();
                self.set_state(pts, date, qts, seq);

                self.last_update = Some(tokio::time::Instant::now());
                self.no_updates_timer.call_once(self.config.no_updates_timeout());
                self.finish_global_request();
            }
            Difference::Slice {
                contents,
                intermediate_state,
            } => {
                self.retry.reset();
                info!(
                    "收到 difference 分片: messages={}, updates={}, 中间 pts={}",
                    contents.new_messages.len(),
                    contents.other_updates.len(),
                    intermediate_state.pts
                );
                self.feed_difference(contents);
                self.set_state(
                    intermediate_state.pts,
                    intermediate_state.date,
                    intermediate_state.qts,
                    intermediate_state.seq,
                );
                self.finish_global_request();
                // 分片后面一定还有数据
                self.get_difference();
            }
            Difference::Full { contents, state } => {
                self.retry.reset();
                info!(
                    "✅ 收到完整 difference: messages={}, updates={}, pts={}",
                    contents.new_messages.len(),
                    contents.other_updates.len(),
                    state.pts
                );
                self.feed_difference(contents);
                self.set_state(state.pts, state.date, state.qts, state.seq);
                self.last_update = Some(tokio::time::Instant::now());
                self.no_updates_timer.call_once(self.config.no_updates_timeout());
                self.finish_global_request();
            }
            Difference::TooLong { pts } => {
                error!("不支持的 difference 类型 too_long: pts={}", pts);
                self.difference_fail(UpdatesError::MalformedResponse(
                    "difference too long is not supported".to_string(),
                ));
            }
        }
    }

    fn finish_global_request(&mut self) {
        self.pts.set_requesting(false);
        self.qts.set_requesting(false);
    }

    /// 失败后保持 requesting，直到退避定时器触发
    pub(crate) fn difference_fail(&mut self, error: UpdatesError) {
        let delay = self.retry.next_delay();
        warn!(
            "⚠️ 拉取 difference 失败: {}, {}s 后重试（连续失败 {} 次）",
            error,
            delay.as_secs(),
            self.retry.failures()
        );
        self.retry_timer.call_once(delay);
    }

    /// 喂入 difference 内容：实体 → MessageId → 新消息 → 其余更新
    fn feed_difference(&mut self, contents: DifferenceContents) {
        let DifferenceContents {
            new_messages,
            other_updates,
            users,
            chats,
        } = contents;
        self.store.apply_entities(&users, &chats);
        self.feed_message_ids(&other_updates);
        self.store.apply_messages(&new_messages, MessageKind::Unread);
        self.feed_update_vector(other_updates, SkipUpdatePolicy::SkipMessageIds);
    }

    /// 拉取频道 difference
    pub fn get_channel_difference(&mut self, channel: ChannelId, reason: ChannelDifferenceReason) {
        let limit = self.config.channel_difference_limit;
        let Some(state) = self.channels.get_mut(channel) else {
            debug!("频道状态不存在，跳过 difference: channel_id={}", channel);
            return;
        };

        if reason != ChannelDifferenceReason::GapOrShortPoll {
            state.short_poll.cancel();
            state.tracker.cancel_gap_timer();
        }
        if !state.tracker.is_inited() || state.tracker.is_requesting() {
            return;
        }
        if reason != ChannelDifferenceReason::AfterFailure {
            state.retry_timer.cancel();
        }

        // 轻量短轮询且没有等待补齐的更新时不带 force
        let force = !(reason == ChannelDifferenceReason::GapOrShortPoll
            && !state.tracker.waiting_for_skipped());
        state.tracker.set_requesting(true);
        let pts = state.pts();

        info!(
            "🔄 拉取频道 difference: channel_id={}, pts={}, reason={:?}, force={}",
            channel, pts, reason, force
        );
        let id = self.send(
            SyncRequest::ChannelDifference {
                channel,
                pts,
                limit,
                force,
            },
            PendingRequest::ChannelDifference(channel),
        );
        if let Some(state) = self.channels.get_mut(channel) {
            state.difference_request = Some(id);
        }
    }

    pub(crate) fn channel_difference_done(&mut self, channel: ChannelId, difference: ChannelDifference) {
        if self.channels.get(channel).is_none() {
            debug!("频道已被驱逐，忽略 difference: channel_id={}", channel);
            return;
        }
        let is_final = difference.is_final();
        let timeout = difference.timeout();
        debug!(
            "收到频道 difference: channel_id={}, type={}, final={}",
            channel,
            difference.type_name(),
            is_final
        );

        if let Some(state) = self.channels.get_mut(channel) {
            state.retry.reset();
        }

        match difference {
            ChannelDifference::Empty { pts, .. } => {
                if let Some(state) = self.channels.get_mut(channel) {
                    state.tracker.init(pts);
                }
            }
            ChannelDifference::TooLong {
                dialog_pts,
                messages,
                users,
                chats,
                ..
            } => {
                warn!(
                    "频道落后太多: channel_id={}, dialog_pts={:?}",
                    channel, dialog_pts
                );
                self.store.apply_entities(&users, &chats);
                // 用旧 pts 校验已加载的历史
                self.request_channel_range_difference(channel);
                if let Some(pts) = dialog_pts {
                    if let Some(state) = self.channels.get_mut(channel) {
                        state.tracker.init(pts);
                    }
                }
                self.store.apply_messages(&messages, MessageKind::Existing);
                self.store.mark_channel_history_stale(channel);
            }
            ChannelDifference::Full {
                pts,
                new_messages,
                other_updates,
                users,
                chats,
                ..
            } => {
                self.feed_channel_difference(new_messages, other_updates, &users, &chats);
                if let Some(state) = self.channels.get_mut(channel) {
                    state.tracker.init(pts);
                }
            }
        }

        let short_poll_delay = self.channels.short_poll_delay();
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };
        state.tracker.set_requesting(false);

        if !is_final {
            info!("频道 difference 未拉完，继续拉取: channel_id={}", channel);
            self.get_channel_difference(channel, ChannelDifferenceReason::Explicit);
        } else if state.active {
            let delay = timeout
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or(short_poll_delay);
            state.short_poll.call_once(delay);
        } else {
            state.short_poll.cancel();
        }
    }

    pub(crate) fn channel_difference_fail(&mut self, channel: ChannelId, error: UpdatesError) {
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };
        let delay = state.retry.next_delay();
        warn!(
            "⚠️ 拉取频道 difference 失败: channel_id={}, error={}, {}s 后重试",
            channel,
            error,
            delay.as_secs()
        );
        state.retry_timer.call_once(delay);
    }

    /// 喂入频道 difference 内容；期间频道更新跳过 pts 检查
    pub(crate) fn feed_channel_difference(
        &mut self,
        new_messages: Vec<Message>,
        other_updates: Vec<Update>,
        users: &[UserEntity],
        chats: &[ChatEntity],
    ) {
        self.store.apply_entities(users, chats);

        self.handling_channel_difference = true;
        self.feed_message_ids(&other_updates);
        self.store.apply_messages(&new_messages, MessageKind::Unread);
        self.feed_update_vector(other_updates, SkipUpdatePolicy::SkipMessageIds);
        self.handling_channel_difference = false;
    }
}
