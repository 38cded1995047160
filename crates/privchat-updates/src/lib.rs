//! Privchat 更新同步引擎
//!
//! 负责让客户端与服务器的更新流保持一致：
//! - 🔢 全局 pts / qts / seq 与频道 pts 的间隙检测
//! - ⏳ 乱序更新短暂等待，超时后用 getDifference 补齐
//! - 📡 频道短轮询、失败指数退避重试
//! - 🧩 频道历史区间校验
//!
//! 引擎本身是同步的状态机，请求放进发件箱，由 [`UpdatesService`]
//! 驱动到传输层上执行。
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use privchat_updates::{
//!     EventStore, JsonRpcTransport, RpcCaller, UpdatesBatch, UpdatesConfig, UpdatesService,
//! };
//!
//! # async fn run<C: RpcCaller + 'static>(caller: C, batch: UpdatesBatch) -> privchat_updates::Result<()> {
//! let config = UpdatesConfig::default();
//! let store = Arc::new(EventStore::new(config.event_capacity));
//! let mut events = store.subscribe();
//!
//! let service = UpdatesService::spawn(config, Arc::new(JsonRpcTransport::new(caller)), store)?;
//! let handle = service.handle();
//! handle.feed(batch).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.event_type());
//! }
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod service;
pub mod store;
pub mod sync;
pub mod timer;
pub mod transport;
pub mod types;
pub mod update;

pub use config::{UpdatesConfig, UpdatesConfigBuilder};
pub use error::{Result, UpdatesError};
pub use service::{InboundEvent, UpdatesHandle, UpdatesService};
pub use store::{EntityStore, EventStore, EventStoreStats, MessageKind, SyncEvent};
pub use sync::{ChannelDifferenceReason, SyncSnapshot, UpdatesEngine};
pub use timer::Timer;
pub use transport::{
    JsonRpcTransport, OutgoingRequest, RequestId, RpcCaller, SyncRequest, SyncResponse,
    UpdatesTransport,
};
pub use types::{
    ChannelDifference, ChannelId, ChatEntity, Difference, DifferenceContents, Message, MsgId,
    MsgRange, PeerId, PtsCount, ServerState, UserEntity, UserId,
};
pub use update::{SkipUpdatePolicy, Update, UpdateKind, UpdatesBatch, UpdatesBody};
