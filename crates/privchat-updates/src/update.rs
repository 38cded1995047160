//! 更新类型
//!
//! `Update` 是封闭枚举，每种更新一个变体；新增更新类型需要扩展枚举并在
//! `sync::feed` 里补充分发分支。

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::types::{ChannelId, ChatEntity, Message, MsgId, PeerId, PtsCount, UserEntity, UserId};

/// 单条更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    NewMessage {
        message: Message,
        pts: PtsCount,
    },
    EditMessage {
        message: Message,
        pts: PtsCount,
    },
    DeleteMessages {
        ids: Vec<MsgId>,
        pts: PtsCount,
    },
    ReadMessagesContents {
        ids: Vec<MsgId>,
        pts: PtsCount,
    },
    ReadHistoryOutbox {
        peer: PeerId,
        max_id: MsgId,
        pts: PtsCount,
    },
    /// qts 序列（每条增量固定为 1）
    NewEncryptedMessage {
        qts: u64,
        #[serde(default)]
        payload: serde_json::Value,
    },
    NewChannelMessage {
        channel: ChannelId,
        message: Message,
        pts: PtsCount,
    },
    EditChannelMessage {
        channel: ChannelId,
        message: Message,
        pts: PtsCount,
    },
    DeleteChannelMessages {
        channel: ChannelId,
        ids: Vec<MsgId>,
        pts: PtsCount,
    },
    PinnedChannelMessages {
        channel: ChannelId,
        ids: Vec<MsgId>,
        pinned: bool,
        pts: PtsCount,
    },
    /// 服务器提示频道落后太多，需要拉频道 difference
    ChannelTooLong {
        channel: ChannelId,
        #[serde(default)]
        pts: Option<u64>,
    },
    /// 本地随机 ID → 服务器消息 ID 映射
    MessageId {
        id: MsgId,
        random_id: u64,
    },
    GroupCallParticipants {
        call_id: u64,
        #[serde(default)]
        payload: serde_json::Value,
    },
    GroupCallChainBlocks {
        call_id: u64,
        #[serde(default)]
        payload: serde_json::Value,
    },
    UserStatus {
        user_id: UserId,
        #[serde(default)]
        payload: serde_json::Value,
    },
    /// 与顺序无关的其它更新
    Generic {
        kind: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

/// 更新所属的排序域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceScope {
    Pts,
    Qts,
    Channel(ChannelId),
}

impl Update {
    pub fn kind(&self) -> UpdateKind {
        match self {
            Update::NewMessage { .. } => UpdateKind::NewMessage,
            Update::EditMessage { .. } => UpdateKind::EditMessage,
            Update::DeleteMessages { .. } => UpdateKind::DeleteMessages,
            Update::ReadMessagesContents { .. } => UpdateKind::ReadMessagesContents,
            Update::ReadHistoryOutbox { .. } => UpdateKind::ReadHistoryOutbox,
            Update::NewEncryptedMessage { .. } => UpdateKind::NewEncryptedMessage,
            Update::NewChannelMessage { .. } => UpdateKind::NewChannelMessage,
            Update::EditChannelMessage { .. } => UpdateKind::EditChannelMessage,
            Update::DeleteChannelMessages { .. } => UpdateKind::DeleteChannelMessages,
            Update::PinnedChannelMessages { .. } => UpdateKind::PinnedChannelMessages,
            Update::ChannelTooLong { .. } => UpdateKind::ChannelTooLong,
            Update::MessageId { .. } => UpdateKind::MessageId,
            Update::GroupCallParticipants { .. } => UpdateKind::GroupCallParticipants,
            Update::GroupCallChainBlocks { .. } => UpdateKind::GroupCallChainBlocks,
            Update::UserStatus { .. } => UpdateKind::UserStatus,
            Update::Generic { .. } => UpdateKind::Generic,
        }
    }

    /// 排序用的计数器对；`None` 表示与顺序无关，可直接应用
    pub fn sequence(&self) -> Option<(SequenceScope, PtsCount)> {
        match self {
            Update::NewMessage { pts, .. }
            | Update::EditMessage { pts, .. }
            | Update::DeleteMessages { pts, .. }
            | Update::ReadMessagesContents { pts, .. }
            | Update::ReadHistoryOutbox { pts, .. } => Some((SequenceScope::Pts, *pts)),
            Update::NewEncryptedMessage { qts, .. } => {
                Some((SequenceScope::Qts, PtsCount::new(*qts, 1)))
            }
            Update::NewChannelMessage { channel, pts, .. }
            | Update::EditChannelMessage { channel, pts, .. }
            | Update::DeleteChannelMessages { channel, pts, .. }
            | Update::PinnedChannelMessages { channel, pts, .. } => {
                Some((SequenceScope::Channel(*channel), *pts))
            }
            Update::ChannelTooLong { .. }
            | Update::MessageId { .. }
            | Update::GroupCallParticipants { .. }
            | Update::GroupCallChainBlocks { .. }
            | Update::UserStatus { .. }
            | Update::Generic { .. } => None,
        }
    }

    /// 涉及的频道
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Update::NewChannelMessage { channel, .. }
            | Update::EditChannelMessage { channel, .. }
            | Update::DeleteChannelMessages { channel, .. }
            | Update::PinnedChannelMessages { channel, .. }
            | Update::ChannelTooLong { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// 批内排序权重：实时类更新排在最前
    pub fn realtime_rank(&self) -> u8 {
        match self {
            Update::GroupCallChainBlocks { .. } => 0,
            Update::GroupCallParticipants { .. } => 1,
            _ => 2,
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime_rank() < 2
    }
}

/// 更新类型（日志与统计用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    NewMessage,
    EditMessage,
    DeleteMessages,
    ReadMessagesContents,
    ReadHistoryOutbox,
    NewEncryptedMessage,
    NewChannelMessage,
    EditChannelMessage,
    DeleteChannelMessages,
    PinnedChannelMessages,
    ChannelTooLong,
    MessageId,
    GroupCallParticipants,
    GroupCallChainBlocks,
    UserStatus,
    Generic,
}

impl UpdateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::EditMessage => "edit_message",
            Self::DeleteMessages => "delete_messages",
            Self::ReadMessagesContents => "read_messages_contents",
            Self::ReadHistoryOutbox => "read_history_outbox",
            Self::NewEncryptedMessage => "new_encrypted_message",
            Self::NewChannelMessage => "new_channel_message",
            Self::EditChannelMessage => "edit_channel_message",
            Self::DeleteChannelMessages => "delete_channel_messages",
            Self::PinnedChannelMessages => "pinned_channel_messages",
            Self::ChannelTooLong => "channel_too_long",
            Self::MessageId => "message_id",
            Self::GroupCallParticipants => "group_call_participants",
            Self::GroupCallChainBlocks => "group_call_chain_blocks",
            Self::UserStatus => "user_status",
            Self::Generic => "generic",
        }
    }
}

impl FromStr for UpdateKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_message" => Ok(Self::NewMessage),
            "edit_message" => Ok(Self::EditMessage),
            "delete_messages" => Ok(Self::DeleteMessages),
            "read_messages_contents" => Ok(Self::ReadMessagesContents),
            "read_history_outbox" => Ok(Self::ReadHistoryOutbox),
            "new_encrypted_message" => Ok(Self::NewEncryptedMessage),
            "new_channel_message" => Ok(Self::NewChannelMessage),
            "edit_channel_message" => Ok(Self::EditChannelMessage),
            "delete_channel_messages" => Ok(Self::DeleteChannelMessages),
            "pinned_channel_messages" => Ok(Self::PinnedChannelMessages),
            "channel_too_long" => Ok(Self::ChannelTooLong),
            "message_id" => Ok(Self::MessageId),
            "group_call_participants" => Ok(Self::GroupCallParticipants),
            "group_call_chain_blocks" => Ok(Self::GroupCallChainBlocks),
            "user_status" => Ok(Self::UserStatus),
            "generic" => Ok(Self::Generic),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 批量应用时的过滤策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipUpdatePolicy {
    SkipNone,
    /// 跳过 MessageId（已经单独处理过）
    SkipMessageIds,
    /// 只保留实时类更新（全量同步进行中）
    SkipExceptRealtime,
}

impl SkipUpdatePolicy {
    pub fn skips(self, update: &Update) -> bool {
        match self {
            SkipUpdatePolicy::SkipNone => false,
            SkipUpdatePolicy::SkipMessageIds => matches!(update, Update::MessageId { .. }),
            SkipUpdatePolicy::SkipExceptRealtime => !update.is_realtime(),
        }
    }
}

/// 一个更新批次的主体
///
/// `seq_start`/`seq` 为 0 表示该批次不参与 seq 排序。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatesBody {
    #[serde(default)]
    pub updates: Vec<Update>,
    #[serde(default)]
    pub users: Vec<UserEntity>,
    #[serde(default)]
    pub chats: Vec<ChatEntity>,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub seq_start: u64,
    #[serde(default)]
    pub seq: u64,
}

impl UpdatesBody {
    /// 批次的起始 seq
    pub fn leading_seq(&self) -> u64 {
        if self.seq_start != 0 {
            self.seq_start
        } else {
            self.seq
        }
    }
}

/// 传输层推送的顶层更新包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdatesBatch {
    Updates(UpdatesBody),
    Short {
        update: Update,
        date: i64,
    },
    /// 精简私聊消息，只带发送者 ID
    ShortMessage {
        message: Message,
        pts: PtsCount,
        date: i64,
    },
    /// 服务器要求客户端拉全局 difference
    TooLong,
}

impl UpdatesBatch {
    /// 不带 seq 的批次
    pub fn unsequenced(updates: Vec<Update>, date: i64) -> Self {
        UpdatesBatch::Updates(UpdatesBody {
            updates,
            date,
            ..Default::default()
        })
    }

    /// 单个 seq 的批次
    pub fn sequenced(updates: Vec<Update>, date: i64, seq: u64) -> Self {
        UpdatesBatch::Updates(UpdatesBody {
            updates,
            date,
            seq_start: seq,
            seq,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(id: MsgId, peer: PeerId) -> Message {
        Message {
            id,
            peer,
            from_id: None,
            date: 0,
            data: json!({}),
        }
    }

    #[test]
    fn test_sequence_scope() {
        let update = Update::NewMessage {
            message: msg(1, PeerId::User(7)),
            pts: PtsCount::new(10, 1),
        };
        assert_eq!(update.sequence(), Some((SequenceScope::Pts, PtsCount::new(10, 1))));

        let update = Update::NewEncryptedMessage {
            qts: 5,
            payload: json!(null),
        };
        assert_eq!(update.sequence(), Some((SequenceScope::Qts, PtsCount::new(5, 1))));

        let update = Update::DeleteChannelMessages {
            channel: 3,
            ids: vec![1, 2],
            pts: PtsCount::new(40, 2),
        };
        assert_eq!(
            update.sequence(),
            Some((SequenceScope::Channel(3), PtsCount::new(40, 2)))
        );
        assert_eq!(update.channel(), Some(3));

        let update = Update::MessageId { id: 9, random_id: 99 };
        assert_eq!(update.sequence(), None);
    }

    #[test]
    fn test_skip_policy() {
        let id = Update::MessageId { id: 1, random_id: 2 };
        let call = Update::GroupCallParticipants {
            call_id: 1,
            payload: json!({}),
        };
        assert!(!SkipUpdatePolicy::SkipNone.skips(&id));
        assert!(SkipUpdatePolicy::SkipMessageIds.skips(&id));
        assert!(!SkipUpdatePolicy::SkipMessageIds.skips(&call));
        assert!(SkipUpdatePolicy::SkipExceptRealtime.skips(&id));
        assert!(!SkipUpdatePolicy::SkipExceptRealtime.skips(&call));
    }

    #[test]
    fn test_update_kind_as_str_and_from_str() {
        assert_eq!(UpdateKind::NewChannelMessage.as_str(), "new_channel_message");
        assert_eq!(
            UpdateKind::from_str("group_call_chain_blocks").unwrap(),
            UpdateKind::GroupCallChainBlocks
        );
        assert!(UpdateKind::from_str("unknown").is_err());
    }

    #[test]
    fn test_batch_wire_format() {
        let batch: UpdatesBatch = serde_json::from_value(json!({
            "type": "updates",
            "updates": [
                { "type": "message_id", "id": 5, "random_id": 77 }
            ],
            "date": 1700000000,
            "seq": 3
        }))
        .unwrap();
        match batch {
            UpdatesBatch::Updates(body) => {
                assert_eq!(body.leading_seq(), 3);
                assert_eq!(body.updates.len(), 1);
            }
            other => panic!("unexpected batch: {:?}", other),
        }
    }
}
