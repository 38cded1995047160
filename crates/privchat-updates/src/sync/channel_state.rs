/// 频道同步状态
///
/// 每个见过的频道一份：频道 pts 追踪器、短轮询定时器、失败退避。
/// 状态放在 slab 里，`ChannelId → ChannelKey` 的索引单独维护，
/// 频道被驱逐时两边一起删。

use std::collections::HashMap;
use std::time::Duration;

use slab::Slab;

use crate::config::UpdatesConfig;
use crate::sync::retry::RetryBackoff;
use crate::sync::sequence_tracker::SequenceTracker;
use crate::timer::Timer;
use crate::types::ChannelId;
use crate::update::Update;
use crate::transport::RequestId;

/// slab 中的下标
pub type ChannelKey = usize;

pub struct ChannelSyncState {
    pub channel: ChannelId,
    pub tracker: SequenceTracker<Update>,
    /// 活跃频道的短轮询
    pub short_poll: Timer,
    pub retry: RetryBackoff,
    pub retry_timer: Timer,
    /// 是否正在被界面查看
    pub active: bool,
    /// 在途的频道 difference 请求
    pub difference_request: Option<RequestId>,
    /// 在途的区间校验请求
    pub range_request: Option<RequestId>,
}

impl ChannelSyncState {
    pub fn new(channel: ChannelId, config: &UpdatesConfig) -> Self {
        Self {
            channel,
            tracker: SequenceTracker::new(config.gap_grace()),
            short_poll: Timer::new(),
            retry: RetryBackoff::new(config.retry_floor(), config.retry_ceiling()),
            retry_timer: Timer::new(),
            active: false,
            difference_request: None,
            range_request: None,
        }
    }

    pub fn pts(&self) -> u64 {
        self.tracker.current()
    }

    /// 所有定时器里最早的截止时间
    pub fn next_deadline(&self) -> Option<tokio::time::Instant> {
        crate::timer::earliest([
            self.tracker.gap_timer().deadline(),
            self.short_poll.deadline(),
            self.retry_timer.deadline(),
        ])
    }
}

/// 频道状态表
pub struct ChannelRegistry {
    states: Slab<ChannelSyncState>,
    index: HashMap<ChannelId, ChannelKey>,
    config: UpdatesConfig,
}

impl ChannelRegistry {
    pub fn new(config: UpdatesConfig) -> Self {
        Self {
            states: Slab::new(),
            index: HashMap::new(),
            config,
        }
    }

    pub fn get_or_insert(&mut self, channel: ChannelId) -> &mut ChannelSyncState {
        let key = match self.index.get(&channel) {
            Some(key) => *key,
            None => {
                let key = self.states.insert(ChannelSyncState::new(channel, &self.config));
                self.index.insert(channel, key);
                key
            }
        };
        &mut self.states[key]
    }

    pub fn get(&self, channel: ChannelId) -> Option<&ChannelSyncState> {
        self.index.get(&channel).and_then(|key| self.states.get(*key))
    }

    pub fn get_mut(&mut self, channel: ChannelId) -> Option<&mut ChannelSyncState> {
        match self.index.get(&channel) {
            Some(key) => self.states.get_mut(*key),
            None => None,
        }
    }

    /// 驱逐频道，返回它的状态（在途请求 ID 需要调用方一并作废）
    pub fn evict(&mut self, channel: ChannelId) -> Option<ChannelSyncState> {
        let key = self.index.remove(&channel)?;
        self.states.try_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelSyncState> {
        self.states.iter().map(|(_, state)| state)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChannelSyncState> {
        self.states.iter_mut().map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn short_poll_delay(&self) -> Duration {
        self.config.short_poll_delay()
    }
}
