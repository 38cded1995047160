//! 测试辅助：记录所有调用的实体存储

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::UpdatesConfig;
use crate::store::{EntityStore, MessageKind};
use crate::sync::engine::UpdatesEngine;
use crate::transport::{SyncRequest, SyncResponse};
use crate::types::{ChannelId, ChatEntity, Message, MsgId, MsgRange, ServerState, UserEntity, UserId};
use crate::update::Update;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Entities { users: usize, chats: usize },
    Messages(Vec<MsgId>, MessageKind),
    Update(Update),
    BatchSettled,
    HistoryStale(ChannelId),
}

#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<StoreCall>>,
    unknown_users: Mutex<HashSet<UserId>>,
    unknown_channels: Mutex<HashSet<ChannelId>>,
    history_ranges: Mutex<HashMap<ChannelId, MsgRange>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    pub fn applied_updates(&self) -> Vec<Update> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                StoreCall::Update(update) => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn mark_user_unknown(&self, user: UserId) {
        self.unknown_users.lock().insert(user);
    }

    pub fn mark_channel_unknown(&self, channel: ChannelId) {
        self.unknown_channels.lock().insert(channel);
    }

    pub fn set_history_range(&self, channel: ChannelId, range: MsgRange) {
        self.history_ranges.lock().insert(channel, range);
    }
}

impl EntityStore for RecordingStore {
    fn apply_entities(&self, users: &[UserEntity], chats: &[ChatEntity]) {
        if users.is_empty() && chats.is_empty() {
            return;
        }
        self.calls.lock().push(StoreCall::Entities {
            users: users.len(),
            chats: chats.len(),
        });
    }

    fn apply_messages(&self, messages: &[Message], kind: MessageKind) {
        if messages.is_empty() {
            return;
        }
        let ids = messages.iter().map(|m| m.id).collect();
        self.calls.lock().push(StoreCall::Messages(ids, kind));
    }

    fn apply_update(&self, update: &Update) {
        self.calls.lock().push(StoreCall::Update(update.clone()));
    }

    fn notify_batch_settled(&self) {
        self.calls.lock().push(StoreCall::BatchSettled);
    }

    fn mark_channel_history_stale(&self, channel: ChannelId) {
        self.calls.lock().push(StoreCall::HistoryStale(channel));
    }

    fn is_user_known(&self, user: UserId) -> bool {
        !self.unknown_users.lock().contains(&user)
    }

    fn is_channel_known(&self, channel: ChannelId) -> bool {
        !self.unknown_channels.lock().contains(&channel)
    }

    fn channel_history_range(&self, channel: ChannelId) -> Option<MsgRange> {
        self.history_ranges.lock().get(&channel).copied()
    }
}

/// 创建引擎并用给定状态完成初始化
pub fn engine_with_state(state: ServerState) -> (UpdatesEngine, Arc<RecordingStore>) {
    let store = Arc::new(RecordingStore::new());
    let mut engine = UpdatesEngine::new(UpdatesConfig::default(), store.clone())
        .expect("default config is valid");
    let outgoing = engine.take_outgoing();
    assert_eq!(outgoing[0].request, SyncRequest::InitialState);
    engine.handle_response(outgoing[0].id, Ok(SyncResponse::State(state)));
    (engine, store)
}

pub fn text_message(id: MsgId, peer: crate::types::PeerId, from: Option<UserId>) -> Message {
    Message {
        id,
        peer,
        from_id: from,
        date: 0,
        data: serde_json::json!({ "text": format!("message {}", id) }),
    }
}
