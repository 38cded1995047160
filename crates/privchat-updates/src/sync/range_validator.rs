/// 频道历史区间校验
///
/// 频道 difference 返回 too long 之后，本地已加载的那段历史可能有洞。
/// 这里用带区间过滤的 difference 把 [from, till) 重新对一遍，
/// 只修正历史内容，不推进频道 pts。

use tracing::{debug, info, warn};

use crate::error::UpdatesError;
use crate::sync::engine::{PendingRequest, UpdatesEngine};
use crate::transport::SyncRequest;
use crate::types::{ChannelDifference, ChannelId, MsgRange};

impl UpdatesEngine {
    /// 校验频道已加载的历史区间，取代该频道之前的校验请求
    pub fn request_channel_range_difference(&mut self, channel: ChannelId) {
        let previous = self
            .channels
            .get_mut(channel)
            .and_then(|state| state.range_request.take());
        if let Some(id) = previous {
            self.forget_request(id);
        }

        let Some(range) = self.store.channel_history_range(channel) else {
            debug!("频道没有已加载的历史，跳过区间校验: channel_id={}", channel);
            return;
        };
        let pts = self.channels.get(channel).map(|state| state.pts()).unwrap_or(0);
        if range.is_empty() || pts == 0 {
            return;
        }

        info!(
            "校验频道历史区间: channel_id={}, range=[{}, {}), pts={}",
            channel, range.from, range.till, pts
        );
        self.validate_channel_range(channel, range, pts);
    }

    /// 发出一次区间过滤的频道 difference
    pub fn validate_channel_range(&mut self, channel: ChannelId, range: MsgRange, pts: u64) {
        if range.is_empty() {
            return;
        }
        let id = self.send(
            SyncRequest::ChannelRangeDifference {
                channel,
                pts,
                range,
                limit: range.limit(),
                force: true,
            },
            PendingRequest::ChannelRange(channel, range),
        );
        self.channels.get_or_insert(channel).range_request = Some(id);
    }

    pub(crate) fn channel_range_difference_done(
        &mut self,
        channel: ChannelId,
        range: MsgRange,
        difference: ChannelDifference,
    ) {
        let is_final = difference.is_final();
        let next_pts = match difference {
            ChannelDifference::Empty { pts, .. } => pts,
            ChannelDifference::TooLong {
                dialog_pts,
                users,
                chats,
                ..
            } => {
                self.store.apply_entities(&users, &chats);
                dialog_pts.unwrap_or(0)
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
                pts
            }
        };

        if !is_final && next_pts != 0 {
            debug!(
                "区间校验未完成，继续: channel_id={}, next_pts={}",
                channel, next_pts
            );
            self.validate_channel_range(channel, range, next_pts);
        }
    }

    /// 历史已经标记为过期，失败不再重试
    pub(crate) fn channel_range_difference_fail(&mut self, channel: ChannelId, error: UpdatesError) {
        warn!("频道区间校验失败: channel_id={}, error={}", channel, error);
    }
}
