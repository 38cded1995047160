/// difference 失败退避
///
/// 第 N 次连续失败后的等待时间为 `min(floor * 2^(N-1), ceiling)`，
/// 成功一次就回到下限。

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryBackoff {
    floor: Duration,
    ceiling: Duration,
    /// 下一次失败要等待的时间
    next: Duration,
    /// 连续失败次数
    failures: u32,
}

impl RetryBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            next: floor,
            failures: 0,
        }
    }

    /// 记一次失败，返回本次应该等待的时间
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.checked_mul(2).unwrap_or(self.ceiling).min(self.ceiling);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// 成功后重置
    pub fn reset(&mut self) {
        self.next = self.floor;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
