/// 更新同步模块
///
/// 职责：
/// - 跟踪全局 pts / qts / seq 以及每个频道的 pts
/// - 检测间隙，等待乱序到达的更新补上
/// - 间隙超时后拉取 difference 补齐
/// - 频道短轮询、失败退避重试与历史区间校验

pub mod channel_state;
pub mod difference;
pub mod engine;
pub mod feed;
pub mod range_validator;
pub mod retry;
pub mod seq_buffer;
pub mod sequence_tracker;

#[cfg(test)]
pub mod test_support;

pub use channel_state::{ChannelRegistry, ChannelSyncState};
pub use difference::ChannelDifferenceReason;
pub use engine::{SyncSnapshot, UpdatesEngine};
pub use retry::RetryBackoff;
pub use seq_buffer::{SeqBuffer, SeqBufferState};
pub use sequence_tracker::{SequenceTracker, TrackOutcome};
