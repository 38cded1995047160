//! 实体存储接口
//!
//! 引擎只负责“什么时候、按什么顺序”应用更新，真正落库由上层实现
//! `EntityStore`。`EventStore` 是一个不落库的实现：把每次应用广播成
//! `SyncEvent`，供界面层或测试订阅。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{ChannelId, ChatEntity, Message, MsgRange, UserEntity, UserId};
use crate::update::Update;

/// 消息来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// 新到达、需要计入未读
    Unread,
    /// 补历史拿到的已有消息
    Existing,
}

/// 实体存储
///
/// 引擎在自己的任务里同步调用这些方法，实现不应阻塞太久。
pub trait EntityStore: Send + Sync {
    /// 先于消息应用用户 / 群组实体
    fn apply_entities(&self, users: &[UserEntity], chats: &[ChatEntity]);

    fn apply_messages(&self, messages: &[Message], kind: MessageKind);

    fn apply_update(&self, update: &Update);

    /// 一批更新处理完毕（刷新会话列表、通知界面等）
    fn notify_batch_settled(&self);

    /// 频道历史可能不完整，下次进入需要重新加载
    fn mark_channel_history_stale(&self, channel: ChannelId);

    /// 本地是否有该用户的实体
    fn is_user_known(&self, _user: UserId) -> bool {
        true
    }

    /// 本地是否有该频道的实体
    fn is_channel_known(&self, _channel: ChannelId) -> bool {
        true
    }

    /// 本地已加载的频道历史区间
    fn channel_history_range(&self, _channel: ChannelId) -> Option<MsgRange> {
        None
    }
}

/// 同步事件
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    EntitiesApplied {
        user_count: usize,
        chat_count: usize,
    },
    MessagesApplied {
        messages: Vec<Message>,
        kind: MessageKind,
    },
    UpdateApplied(Update),
    BatchSettled {
        /// 毫秒时间戳
        timestamp: i64,
    },
    ChannelHistoryStale {
        channel: ChannelId,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::EntitiesApplied { .. } => "entities_applied",
            SyncEvent::MessagesApplied { .. } => "messages_applied",
            SyncEvent::UpdateApplied(_) => "update_applied",
            SyncEvent::BatchSettled { .. } => "batch_settled",
            SyncEvent::ChannelHistoryStale { .. } => "channel_history_stale",
        }
    }
}

/// 事件统计
#[derive(Debug, Clone, Default)]
pub struct EventStoreStats {
    pub total_events: u64,
    pub events_by_type: HashMap<&'static str, u64>,
    pub last_event_time: Option<i64>,
}

/// 广播式实体存储
pub struct EventStore {
    sender: broadcast::Sender<SyncEvent>,
    known_users: RwLock<HashSet<UserId>>,
    known_channels: RwLock<HashSet<ChannelId>>,
    history_ranges: RwLock<HashMap<ChannelId, MsgRange>>,
    stats: RwLock<EventStoreStats>,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            known_users: RwLock::new(HashSet::new()),
            known_channels: RwLock::new(HashSet::new()),
            history_ranges: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventStoreStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// 设置频道已加载的历史区间
    pub fn set_history_range(&self, channel: ChannelId, range: MsgRange) {
        self.history_ranges.write().insert(channel, range);
    }

    pub fn stats(&self) -> EventStoreStats {
        self.stats.read().clone()
    }

    fn emit(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type()).or_insert(0) += 1;
            stats.last_event_time = Some(chrono::Utc::now().timestamp_millis());
        }

        // 没有订阅者时 send 失败属于正常情况
        if let Err(e) = self.sender.send(event) {
            debug!("同步事件无订阅者: {}", e);
        }
    }
}

impl EntityStore for EventStore {
    fn apply_entities(&self, users: &[UserEntity], chats: &[ChatEntity]) {
        if users.is_empty() && chats.is_empty() {
            return;
        }
        self.known_users.write().extend(users.iter().map(|u| u.id));
        self.known_channels
            .write()
            .extend(chats.iter().filter(|c| c.is_channel).map(|c| c.id));
        self.emit(SyncEvent::EntitiesApplied {
            user_count: users.len(),
            chat_count: chats.len(),
        });
    }

    fn apply_messages(&self, messages: &[Message], kind: MessageKind) {
        if messages.is_empty() {
            return;
        }
        self.emit(SyncEvent::MessagesApplied {
            messages: messages.to_vec(),
            kind,
        });
    }

    fn apply_update(&self, update: &Update) {
        self.emit(SyncEvent::UpdateApplied(update.clone()));
    }

    fn notify_batch_settled(&self) {
        self.emit(SyncEvent::BatchSettled {
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
    }

    fn mark_channel_history_stale(&self, channel: ChannelId) {
        self.emit(SyncEvent::ChannelHistoryStale { channel });
    }

    fn is_user_known(&self, user: UserId) -> bool {
        self.known_users.read().contains(&user)
    }

    fn is_channel_known(&self, channel: ChannelId) -> bool {
        self.known_channels.read().contains(&channel)
    }

    fn channel_history_range(&self, channel: ChannelId) -> Option<MsgRange> {
        self.history_ranges.read().get(&channel).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let store = EventStore::new(16);
        let mut rx = store.subscribe();

        store.apply_entities(
            &[UserEntity { id: 1, data: json!({}) }],
            &[ChatEntity { id: 9, is_channel: true, data: json!({}) }],
        );
        let message = Message {
            id: 5,
            peer: PeerId::User(1),
            from_id: Some(1),
            date: 0,
            data: json!({}),
        };
        store.apply_messages(&[message], MessageKind::Unread);
        store.notify_batch_settled();

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::EntitiesApplied { user_count: 1, chat_count: 1 }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::MessagesApplied { kind: MessageKind::Unread, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::BatchSettled { .. }));

        assert!(store.is_user_known(1));
        assert!(!store.is_user_known(2));
        assert!(store.is_channel_known(9));
        assert_eq!(store.stats().total_events, 3);
    }

    #[test]
    fn test_empty_applies_are_silent() {
        let store = EventStore::new(4);
        store.apply_entities(&[], &[]);
        store.apply_messages(&[], MessageKind::Existing);
        assert_eq!(store.stats().total_events, 0);
    }

    #[test]
    fn test_history_range() {
        let store = EventStore::new(4);
        assert_eq!(store.channel_history_range(3), None);
        store.set_history_range(3, MsgRange::new(100, 140));
        assert_eq!(store.channel_history_range(3), Some(MsgRange::new(100, 140)));
    }
}
