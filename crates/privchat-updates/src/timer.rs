//! 可取消的单次定时器
//!
//! 定时器只记录截止时间，本身不持有任务；由 `UpdatesService` 的事件循环
//! 在 `next_deadline()` 到期时调用引擎的 `on_timer()` 统一检查。

use std::time::Duration;
use tokio::time::Instant;

/// 单次定时器句柄
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// 从现在起 `delay` 后触发；已激活时会覆盖原截止时间
    pub fn call_once(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 到期则复位并返回 true
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// 取多个截止时间里最早的一个
pub(crate) fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}
