//! 传输层
//!
//! 引擎不直接发网络请求：它把 `SyncRequest` 放进发件箱，由
//! `UpdatesService` 交给 `UpdatesTransport` 执行，结果按 `RequestId`
//! 送回引擎。已被取代的请求 ID 会在引擎里被忽略。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, UpdatesError};
use crate::types::{ChannelDifference, ChannelId, Difference, MsgRange, ServerState};

/// 请求 ID，引擎内单调递增
pub type RequestId = u64;

/// 引擎发出的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    /// updates.getState
    InitialState,
    /// updates.getDifference
    GlobalDifference { pts: u64, date: i64, qts: u64 },
    /// updates.getChannelDifference
    ChannelDifference {
        channel: ChannelId,
        pts: u64,
        limit: u32,
        force: bool,
    },
    /// 带消息区间过滤的频道 difference，用于历史区间校验
    ChannelRangeDifference {
        channel: ChannelId,
        pts: u64,
        range: MsgRange,
        limit: u32,
        force: bool,
    },
    /// 保活，响应里的更新走正常推送通道
    Ping,
}

impl SyncRequest {
    pub fn route(&self) -> &'static str {
        match self {
            SyncRequest::InitialState => "updates/get_state",
            SyncRequest::GlobalDifference { .. } => "updates/get_difference",
            SyncRequest::ChannelDifference { .. } | SyncRequest::ChannelRangeDifference { .. } => {
                "updates/get_channel_difference"
            }
            SyncRequest::Ping => "updates/ping",
        }
    }
}

/// 请求结果
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResponse {
    State(ServerState),
    Difference(Difference),
    ChannelDifference(ChannelDifference),
    Pong,
}

impl SyncResponse {
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncResponse::State(_) => "state",
            SyncResponse::Difference(_) => "difference",
            SyncResponse::ChannelDifference(_) => "channel_difference",
            SyncResponse::Pong => "pong",
        }
    }
}

/// 发件箱中的一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRequest {
    pub id: RequestId,
    pub request: SyncRequest,
}

/// 更新同步所需的远程调用
#[async_trait]
pub trait UpdatesTransport: Send + Sync {
    async fn get_state(&self) -> Result<ServerState>;

    async fn get_difference(&self, pts: u64, date: i64, qts: u64) -> Result<Difference>;

    async fn get_channel_difference(
        &self,
        channel: ChannelId,
        pts: u64,
        limit: u32,
        force: bool,
    ) -> Result<ChannelDifference>;

    async fn get_channel_range_difference(
        &self,
        channel: ChannelId,
        pts: u64,
        range: MsgRange,
        limit: u32,
    ) -> Result<ChannelDifference>;

    async fn ping(&self) -> Result<()>;
}

/// 执行一个请求
pub async fn execute(transport: &dyn UpdatesTransport, request: SyncRequest) -> Result<SyncResponse> {
    match request {
        SyncRequest::InitialState => transport.get_state().await.map(SyncResponse::State),
        SyncRequest::GlobalDifference { pts, date, qts } => transport
            .get_difference(pts, date, qts)
            .await
            .map(SyncResponse::Difference),
        SyncRequest::ChannelDifference {
            channel,
            pts,
            limit,
            force,
        } => transport
            .get_channel_difference(channel, pts, limit, force)
            .await
            .map(SyncResponse::ChannelDifference),
        SyncRequest::ChannelRangeDifference {
            channel,
            pts,
            range,
            limit,
            ..
        } => transport
            .get_channel_range_difference(channel, pts, range, limit)
            .await
            .map(SyncResponse::ChannelDifference),
        SyncRequest::Ping => transport.ping().await.map(|_| SyncResponse::Pong),
    }
}

/// 通用 JSON RPC 调用
#[async_trait]
pub trait RpcCaller: Send + Sync {
    async fn call_rpc(&self, route: &str, body: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDifferenceRequest {
    pub pts: u64,
    pub date: i64,
    pub qts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChannelDifferenceRequest {
    pub channel_id: ChannelId,
    pub pts: u64,
    pub limit: u32,
    pub force: bool,
    /// 只返回区间内的消息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<MsgRange>,
}

/// 基于 `RpcCaller` 的传输实现
pub struct JsonRpcTransport<C> {
    caller: C,
}

impl<C: RpcCaller> JsonRpcTransport<C> {
    pub fn new(caller: C) -> Self {
        Self { caller }
    }

    async fn call<Req, Res>(&self, route: &str, request: &Req) -> Result<Res>
    where
        Req: Serialize,
        Res: serde::de::DeserializeOwned,
    {
        let request_value = serde_json::to_value(request)?;
        let response_value = self.caller.call_rpc(route, request_value).await?;
        serde_json::from_value(response_value).map_err(|e| {
            debug!("解析 {} 响应失败: {}", route, e);
            UpdatesError::MalformedResponse(format!("{}: {}", route, e))
        })
    }
}

#[async_trait]
impl<C: RpcCaller> UpdatesTransport for JsonRpcTransport<C> {
    async fn get_state(&self) -> Result<ServerState> {
        self.call("updates/get_state", &serde_json::json!({})).await
    }

    async fn get_difference(&self, pts: u64, date: i64, qts: u64) -> Result<Difference> {
        let request = GetDifferenceRequest { pts, date, qts };
        self.call("updates/get_difference", &request).await
    }

    async fn get_channel_difference(
        &self,
        channel: ChannelId,
        pts: u64,
        limit: u32,
        force: bool,
    ) -> Result<ChannelDifference> {
        let request = GetChannelDifferenceRequest {
            channel_id: channel,
            pts,
            limit,
            force,
            range: None,
        };
        self.call("updates/get_channel_difference", &request).await
    }

    async fn get_channel_range_difference(
        &self,
        channel: ChannelId,
        pts: u64,
        range: MsgRange,
        limit: u32,
    ) -> Result<ChannelDifference> {
        let request = GetChannelDifferenceRequest {
            channel_id: channel,
            pts,
            limit,
            force: true,
            range: Some(range),
        };
        self.call("updates/get_channel_difference", &request).await
    }

    async fn ping(&self) -> Result<()> {
        self.caller
            .call_rpc("updates/ping", serde_json::json!({}))
            .await
            .map(|_| ())
    }
}
