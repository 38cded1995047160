/// 更新分发
///
/// 传输层推来的批次从 `receive_updates` 进入：
/// 1. seq 检查（重复丢弃、提前到达的进乱序缓冲）
/// 2. 实体先于更新应用
/// 3. 逐条按排序域交给对应的序列追踪器，能应用的才交给实体存储
/// 4. 一批处理完通知实体存储

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::sync::engine::UpdatesEngine;
use crate::sync::sequence_tracker::TrackOutcome;
use crate::types::{ChannelId, ChatEntity, Message, PtsCount, UserEntity};
use crate::update::{SequenceScope, SkipUpdatePolicy, Update, UpdatesBatch};

impl UpdatesEngine {
    /// 传输层推送入口
    pub fn receive_updates(&mut self, batch: UpdatesBatch) {
        self.last_update = Some(Instant::now());
        self.no_updates_timer.call_once(self.config.no_updates_timeout());

        if !self.is_requesting_difference() {
            self.apply_updates(batch);
            return;
        }

        // 全量同步进行中，difference 会带回这些更新，只放行实时类
        match batch {
            UpdatesBatch::Updates(body) => {
                self.store.apply_entities(&body.users, &body.chats);
                self.feed_update_vector(body.updates, SkipUpdatePolicy::SkipExceptRealtime);
            }
            UpdatesBatch::Short { update, .. } if update.is_realtime() => {
                self.feed_update(update);
                self.store.notify_batch_settled();
            }
            _ => {
                debug!("正在拉取 difference，跳过推送批次");
            }
        }
    }

    fn apply_updates(&mut self, batch: UpdatesBatch) {
        match batch {
            UpdatesBatch::Updates(body) => {
                let seq_start = body.leading_seq();
                if seq_start != 0 {
                    if seq_start <= self.seq {
                        debug!(
                            "丢弃重复批次: seq_start={}, 当前 seq={}",
                            seq_start, self.seq
                        );
                        return;
                    }
                    if seq_start > self.seq + 1 {
                        debug!(
                            "批次提前到达，暂存: seq_start={}, 当前 seq={}",
                            seq_start, self.seq
                        );
                        self.seq_buffer.hold(seq_start, body);
                        return;
                    }
                }

                let date = body.date;
                let seq = body.seq;
                self.apply_updates_body(body.updates, &body.users, &body.chats);
                let qts = self.qts.current();
                self.set_state(0, date, qts, seq);
            }
            UpdatesBatch::Short { update, date } => {
                self.feed_update(update);
                self.store.notify_batch_settled();
                let qts = self.qts.current();
                self.set_state(0, date, qts, 0);
            }
            UpdatesBatch::ShortMessage { message, pts, date } => {
                if self.is_sender_unknown(&message) {
                    info!(
                        "精简消息的发送者未知，拉取 difference: message_id={}",
                        message.id
                    );
                    self.get_difference();
                    return;
                }
                let update = Update::NewMessage { message, pts };
                let kind = update.kind();
                let outcome = self.pts.update_and_apply(pts, update);
                let applied = self.apply_tracked("pts", pts, kind.as_str(), outcome);
                self.store.notify_batch_settled();
                // 暂存或重复的消息不推进 date
                if applied {
                    let qts = self.qts.current();
                    self.set_state(0, date, qts, 0);
                }
            }
            UpdatesBatch::TooLong => {
                info!("服务器要求拉取 difference（updates too long）");
                self.get_difference();
            }
        }
    }

    /// 应用一个批次的主体：实体在前，更新在后
    pub(crate) fn apply_updates_body(
        &mut self,
        updates: Vec<Update>,
        users: &[UserEntity],
        chats: &[ChatEntity],
    ) {
        self.store.apply_entities(users, chats);
        self.feed_update_vector(updates, SkipUpdatePolicy::SkipNone);
    }

    /// 按策略批量分发
    pub(crate) fn feed_update_vector(&mut self, mut updates: Vec<Update>, policy: SkipUpdatePolicy) {
        if updates.iter().any(Update::is_realtime) {
            // 稳定排序，实时类排在最前
            updates.sort_by_key(Update::realtime_rank);
        } else if policy == SkipUpdatePolicy::SkipExceptRealtime {
            return;
        }

        for update in updates {
            if policy.skips(&update) {
                continue;
            }
            self.feed_update(update);
        }
        self.store.notify_batch_settled();
    }

    /// 只分发 MessageId 映射，difference 里需要先于消息处理
    pub(crate) fn feed_message_ids(&mut self, updates: &[Update]) {
        for update in updates {
            if matches!(update, Update::MessageId { .. }) {
                self.feed_update(update.clone());
            }
        }
    }

    /// 分发单条更新
    pub(crate) fn feed_update(&mut self, update: Update) {
        match update.sequence() {
            Some((SequenceScope::Pts, pts)) => {
                if let Update::NewMessage { message, .. } = &update {
                    if !self.is_requesting_difference() && self.is_sender_unknown(message) {
                        info!(
                            "新消息的发送者未知，拉取 difference: message_id={}",
                            message.id
                        );
                        self.get_difference();
                        return;
                    }
                }
                let kind = update.kind();
                let outcome = self.pts.update_and_apply(pts, update);
                self.apply_tracked("pts", pts, kind.as_str(), outcome);
            }
            Some((SequenceScope::Qts, qts)) => {
                let kind = update.kind();
                let outcome = self.qts.update_and_apply(qts, update);
                self.apply_tracked("qts", qts, kind.as_str(), outcome);
            }
            Some((SequenceScope::Channel(channel), pts)) => {
                self.feed_channel_update(channel, pts, update);
            }
            None => match update {
                Update::ChannelTooLong { channel, pts } => {
                    self.handle_channel_too_long(channel, pts);
                }
                other => self.store.apply_update(&other),
            },
        }
    }

    fn feed_channel_update(&mut self, channel: ChannelId, pts: PtsCount, update: Update) {
        if self.handling_channel_difference {
            // 频道 difference 的内容已经由服务器排好序
            self.store.apply_update(&update);
            return;
        }

        let channel_known = self.store.is_channel_known(channel);
        if !channel_known
            && !self.is_requesting_difference()
            && matches!(update, Update::NewChannelMessage { .. })
        {
            debug!("收到未知频道的新消息: channel_id={}", channel);
            if !self.by_min_channel_timer.is_active() {
                self.by_min_channel_timer.call_once(self.config.gap_grace());
            }
            return;
        }
        if !channel_known {
            self.store.apply_update(&update);
            return;
        }

        let state = self.channels.get_or_insert(channel);
        if state.tracker.is_requesting() {
            debug!(
                "频道 difference 进行中，跳过推送: channel_id={}, pts={}",
                channel, pts.pts
            );
            return;
        }
        let kind = update.kind();
        let outcome = state.tracker.update_and_apply(pts, update);
        self.apply_tracked("channel_pts", pts, kind.as_str(), outcome);
    }

    /// 返回这条更新是否已交给实体存储
    fn apply_tracked(
        &self,
        scope: &str,
        pts: PtsCount,
        kind: &str,
        outcome: TrackOutcome<Update>,
    ) -> bool {
        match outcome {
            TrackOutcome::Applied(updates) => {
                for update in &updates {
                    self.store.apply_update(update);
                }
                true
            }
            TrackOutcome::Unchecked(update) => {
                self.store.apply_update(&update);
                true
            }
            TrackOutcome::Duplicate => {
                debug!(
                    "丢弃重复更新: scope={}, kind={}, pts={}, count={}",
                    scope, kind, pts.pts, pts.count
                );
                false
            }
            TrackOutcome::Held => {
                warn!(
                    "检测到间隙，暂存更新: scope={}, kind={}, pts={}, count={}",
                    scope, kind, pts.pts, pts.count
                );
                false
            }
        }
    }

    fn handle_channel_too_long(&mut self, channel: ChannelId, pts: Option<u64>) {
        if !self.store.is_channel_known(channel) {
            debug!("忽略未知频道的 too long: channel_id={}", channel);
            return;
        }
        let local = self.channels.get(channel).map(|state| state.pts()).unwrap_or(0);
        if pts.map_or(true, |server_pts| local < server_pts) {
            self.get_channel_difference(
                channel,
                crate::sync::difference::ChannelDifferenceReason::Explicit,
            );
        }
    }

    fn is_sender_unknown(&self, message: &Message) -> bool {
        message
            .from_id
            .map(|user| !self.store.is_user_known(user))
            .unwrap_or(false)
    }
}
