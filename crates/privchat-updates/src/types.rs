//! 同步协议数据模型
//!
//! 计数器（pts/qts/seq/date）对本模块来说是不透明整数，业务载荷统一用
//! `serde_json::Value` 透传给实体存储。

use serde::{Deserialize, Serialize};

use crate::update::Update;

pub type ChannelId = u64;
pub type UserId = u64;
pub type ChatId = u64;
pub type MsgId = i64;

/// 会话对端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PeerId {
    User(UserId),
    Chat(ChatId),
    Channel(ChannelId),
}

impl PeerId {
    pub fn as_channel(self) -> Option<ChannelId> {
        match self {
            PeerId::Channel(id) => Some(id),
            _ => None,
        }
    }
}

/// 计数器对：更新后的计数值 + 本条更新贡献的增量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PtsCount {
    pub pts: u64,
    pub count: u64,
}

impl PtsCount {
    pub fn new(pts: u64, count: u64) -> Self {
        Self { pts, count }
    }
}

/// 消息 ID 半开区间 [from, till)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgRange {
    pub from: MsgId,
    pub till: MsgId,
}

impl MsgRange {
    pub fn new(from: MsgId, till: MsgId) -> Self {
        Self { from, till }
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.till
    }

    /// 区间长度，作为过滤 difference 的 limit
    pub fn limit(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        u32::try_from(self.till - self.from).unwrap_or(u32::MAX)
    }
}

/// 服务器状态（updates.state）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub pts: u64,
    pub qts: u64,
    pub seq: u64,
    /// 服务器时间水位（unix 秒）
    pub date: i64,
}

/// 用户实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntity {
    pub id: UserId,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// 群组 / 频道实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntity {
    pub id: ChatId,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// 消息
///
/// 只解析排序和完整性检查需要的字段，其余内容原样放在 `data` 里。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MsgId,
    pub peer: PeerId,
    #[serde(default)]
    pub from_id: Option<UserId>,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// difference 携带的内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifferenceContents {
    #[serde(default)]
    pub new_messages: Vec<Message>,
    #[serde(default)]
    pub other_updates: Vec<Update>,
    #[serde(default)]
    pub users: Vec<UserEntity>,
    #[serde(default)]
    pub chats: Vec<ChatEntity>,
}

/// 全局 getDifference 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Difference {
    /// 无变化
    Empty { date: i64, seq: u64 },
    /// 部分数据，后面还有
    Slice {
        contents: DifferenceContents,
        intermediate_state: ServerState,
    },
    /// 完整数据
    Full {
        contents: DifferenceContents,
        state: ServerState,
    },
    /// 客户端落后太多，本引擎不支持，按失败处理
    TooLong { pts: u64 },
}

/// 频道 getChannelDifference 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelDifference {
    Empty {
        pts: u64,
        #[serde(default = "default_final")]
        is_final: bool,
        #[serde(default)]
        timeout: Option<u32>,
    },
    TooLong {
        /// 会话里带回的 pts，可能缺失
        #[serde(default)]
        dialog_pts: Option<u64>,
        #[serde(default)]
        messages: Vec<Message>,
        #[serde(default)]
        users: Vec<UserEntity>,
        #[serde(default)]
        chats: Vec<ChatEntity>,
        #[serde(default = "default_final")]
        is_final: bool,
        #[serde(default)]
        timeout: Option<u32>,
    },
    Full {
        pts: u64,
        #[serde(default)]
        new_messages: Vec<Message>,
        #[serde(default)]
        other_updates: Vec<Update>,
        #[serde(default)]
        users: Vec<UserEntity>,
        #[serde(default)]
        chats: Vec<ChatEntity>,
        #[serde(default = "default_final")]
        is_final: bool,
        #[serde(default)]
        timeout: Option<u32>,
    },
}

fn default_final() -> bool {
    true
}

impl ChannelDifference {
    pub fn is_final(&self) -> bool {
        match self {
            ChannelDifference::Empty { is_final, .. }
            | ChannelDifference::TooLong { is_final, .. }
            | ChannelDifference::Full { is_final, .. } => *is_final,
        }
    }

    /// 服务器建议的下次短轮询间隔（秒）
    pub fn timeout(&self) -> Option<u32> {
        match self {
            ChannelDifference::Empty { timeout, .. }
            | ChannelDifference::TooLong { timeout, .. }
            | ChannelDifference::Full { timeout, .. } => *timeout,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelDifference::Empty { .. } => "empty",
            ChannelDifference::TooLong { .. } => "too_long",
            ChannelDifference::Full { .. } => "full",
        }
    }
}

impl Difference {
    pub fn type_name(&self) -> &'static str {
        match self {
            Difference::Empty { .. } => "empty",
            Difference::Slice { .. } => "slice",
            Difference::Full { .. } => "full",
            Difference::TooLong { .. } => "too_long",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_msg_range() {
        assert!(MsgRange::new(20, 10).is_empty());
        assert!(MsgRange::new(10, 10).is_empty());
        assert_eq!(MsgRange::new(10, 20).limit(), 10);
        assert_eq!(MsgRange::new(20, 10).limit(), 0);
    }

    #[test]
    fn test_channel_difference_defaults_to_final() {
        let diff: ChannelDifference =
            serde_json::from_value(json!({ "type": "empty", "pts": 7 })).unwrap();
        assert!(diff.is_final());
        assert_eq!(diff.timeout(), None);

        let diff: ChannelDifference = serde_json::from_value(json!({
            "type": "full",
            "pts": 9,
            "is_final": false,
            "timeout": 30
        }))
        .unwrap();
        assert!(!diff.is_final());
        assert_eq!(diff.timeout(), Some(30));
    }

    #[test]
    fn test_unknown_difference_type_is_rejected() {
        let result = serde_json::from_value::<Difference>(json!({ "type": "bogus" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_peer_id_format() {
        let peer: PeerId = serde_json::from_value(json!({ "type": "channel", "id": 42 })).unwrap();
        assert_eq!(peer, PeerId::Channel(42));
        assert_eq!(peer.as_channel(), Some(42));
        assert_eq!(PeerId::User(1).as_channel(), None);
    }
}
