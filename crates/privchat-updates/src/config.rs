//! 更新同步配置
//!
//! 这些常数都是经验值，影响的是延迟与请求量之间的取舍，不影响正确性。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, UpdatesError};

/// 更新同步配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesConfig {
    /// 检测到间隙后等待乱序补齐的宽限期（毫秒）
    pub gap_grace_ms: u64,
    /// 多久没收到任何更新就发 ping（秒）
    pub no_updates_timeout_secs: u64,
    /// 休眠唤醒后多久没收到更新就发 ping（秒）
    pub no_updates_after_sleep_timeout_secs: u64,
    /// 单次频道 difference 拉取条数
    pub channel_difference_limit: u32,
    /// 活跃频道短轮询默认间隔（毫秒），服务器给出 timeout 时以服务器为准
    pub short_poll_delay_ms: u64,
    /// difference 失败退避下限（秒）
    pub retry_floor_secs: u64,
    /// difference 失败退避上限（秒）
    pub retry_ceiling_secs: u64,
    /// 服务入站队列容量
    pub inbound_queue_size: usize,
    /// 同步事件广播容量
    pub event_capacity: usize,
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            gap_grace_ms: 1000,
            no_updates_timeout_secs: 60,
            no_updates_after_sleep_timeout_secs: 60,
            channel_difference_limit: 100,
            short_poll_delay_ms: 1000,
            retry_floor_secs: 1,
            retry_ceiling_secs: 64,
            inbound_queue_size: 256,
            event_capacity: 1024,
        }
    }
}

impl UpdatesConfig {
    pub fn builder() -> UpdatesConfigBuilder {
        UpdatesConfigBuilder::new()
    }

    pub fn gap_grace(&self) -> Duration {
        Duration::from_millis(self.gap_grace_ms)
    }

    pub fn no_updates_timeout(&self) -> Duration {
        Duration::from_secs(self.no_updates_timeout_secs)
    }

    pub fn no_updates_after_sleep_timeout(&self) -> Duration {
        Duration::from_secs(self.no_updates_after_sleep_timeout_secs)
    }

    pub fn short_poll_delay(&self) -> Duration {
        Duration::from_millis(self.short_poll_delay_ms)
    }

    pub fn retry_floor(&self) -> Duration {
        Duration::from_secs(self.retry_floor_secs)
    }

    pub fn retry_ceiling(&self) -> Duration {
        Duration::from_secs(self.retry_ceiling_secs)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.retry_floor_secs == 0 {
            return Err(UpdatesError::Config("retry_floor_secs 必须大于 0".to_string()));
        }
        if self.retry_ceiling_secs < self.retry_floor_secs {
            return Err(UpdatesError::Config(format!(
                "retry_ceiling_secs({}) 不能小于 retry_floor_secs({})",
                self.retry_ceiling_secs, self.retry_floor_secs
            )));
        }
        if self.channel_difference_limit == 0 {
            return Err(UpdatesError::Config(
                "channel_difference_limit 必须大于 0".to_string(),
            ));
        }
        if self.inbound_queue_size == 0 || self.event_capacity == 0 {
            return Err(UpdatesError::Config("队列容量必须大于 0".to_string()));
        }
        Ok(())
    }
}

/// 配置构建器
pub struct UpdatesConfigBuilder {
    config: UpdatesConfig,
}

impl UpdatesConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: UpdatesConfig::default(),
        }
    }

    pub fn gap_grace_ms(mut self, ms: u64) -> Self {
        self.config.gap_grace_ms = ms;
        self
    }

    pub fn no_updates_timeout_secs(mut self, secs: u64) -> Self {
        self.config.no_updates_timeout_secs = secs;
        self
    }

    pub fn no_updates_after_sleep_timeout_secs(mut self, secs: u64) -> Self {
        self.config.no_updates_after_sleep_timeout_secs = secs;
        self
    }

    pub fn channel_difference_limit(mut self, limit: u32) -> Self {
        self.config.channel_difference_limit = limit;
        self
    }

    pub fn short_poll_delay_ms(mut self, ms: u64) -> Self {
        self.config.short_poll_delay_ms = ms;
        self
    }

    /// 设置退避区间（秒）
    pub fn retry_backoff_secs(mut self, floor: u64, ceiling: u64) -> Self {
        self.config.retry_floor_secs = floor;
        self.config.retry_ceiling_secs = ceiling;
        self
    }

    pub fn inbound_queue_size(mut self, size: usize) -> Self {
        self.config.inbound_queue_size = size;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<UpdatesConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for UpdatesConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UpdatesConfig::default();
        assert_eq!(config.gap_grace(), Duration::from_millis(1000));
        assert_eq!(config.no_updates_timeout(), Duration::from_secs(60));
        assert_eq!(config.retry_floor(), Duration::from_secs(1));
        assert_eq!(config.retry_ceiling(), Duration::from_secs(64));
        assert_eq!(config.channel_difference_limit, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_inverted_backoff() {
        let result = UpdatesConfig::builder().retry_backoff_secs(8, 4).build();
        assert!(matches!(result, Err(UpdatesError::Config(_))));

        let result = UpdatesConfig::builder().retry_backoff_secs(0, 4).build();
        assert!(matches!(result, Err(UpdatesError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: UpdatesConfig =
            serde_json::from_value(serde_json::json!({ "gap_grace_ms": 250 })).unwrap();
        assert_eq!(config.gap_grace_ms, 250);
        assert_eq!(config.retry_ceiling_secs, 64);
    }
}
