/// 乱序批次缓冲
///
/// 带 seq 的批次提前到达时按 `seq_start` 暂存，等前面的批次补齐后
/// 由引擎逐个取出应用；宽限期内补不齐就整体丢弃并拉 difference。

use std::collections::BTreeMap;
use std::time::Duration;

use crate::timer::Timer;

/// 缓冲状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqBufferState {
    Empty,
    /// 有批次在等前面的 seq
    Buffering,
    /// 正在依次释放
    Draining,
}

pub struct SeqBuffer<B> {
    batches: BTreeMap<u64, B>,
    timer: Timer,
    grace: Duration,
    draining: bool,
}

impl<B> SeqBuffer<B> {
    pub fn new(grace: Duration) -> Self {
        Self {
            batches: BTreeMap::new(),
            timer: Timer::new(),
            grace,
            draining: false,
        }
    }

    /// 暂存一个提前到达的批次，同一 `seq_start` 后到的覆盖先到的
    pub fn hold(&mut self, seq_start: u64, batch: B) {
        self.batches.insert(seq_start, batch);
        self.timer.call_once(self.grace);
    }

    /// 取出紧接 `current_seq` 的批次
    ///
    /// 已经过时的批次直接丢弃；取不到时如果还有暂存的批次就保持计时。
    pub fn take_next(&mut self, current_seq: u64) -> Option<B> {
        while let Some(entry) = self.batches.first_entry() {
            let seq_start = *entry.key();
            if seq_start <= current_seq {
                entry.remove();
            } else if seq_start == current_seq + 1 {
                self.draining = true;
                return Some(entry.remove());
            } else {
                break;
            }
        }

        self.draining = false;
        if self.batches.is_empty() {
            self.timer.cancel();
        } else if !self.timer.is_active() {
            self.timer.call_once(self.grace);
        }
        None
    }

    /// 丢弃全部暂存批次
    pub fn clear(&mut self) {
        self.batches.clear();
        self.timer.cancel();
        self.draining = false;
    }

    pub fn cancel_timer(&mut self) {
        self.timer.cancel();
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// 宽限期到期
    pub fn poll(&mut self, now: tokio::time::Instant) -> bool {
        self.timer.fire_if_due(now)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn state(&self) -> SeqBufferState {
        if self.batches.is_empty() && !self.draining {
            SeqBufferState::Empty
        } else if self.draining {
            SeqBufferState::Draining
        } else {
            SeqBufferState::Buffering
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_release() {
        let mut buffer = SeqBuffer::new(Duration::from_secs(1));
        buffer.hold(7, "b7");
        buffer.hold(6, "b6");
        assert_eq!(buffer.state(), SeqBufferState::Buffering);
        assert!(buffer.timer().is_active());

        // 当前 seq=4，5 还没到
        assert_eq!(buffer.take_next(4), None);
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.take_next(5), Some("b6"));
        assert_eq!(buffer.state(), SeqBufferState::Draining);
        assert_eq!(buffer.take_next(6), Some("b7"));
        assert_eq!(buffer.take_next(7), None);
        assert_eq!(buffer.state(), SeqBufferState::Empty);
        assert!(!buffer.timer().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_batches_are_dropped() {
        let mut buffer = SeqBuffer::new(Duration::from_secs(1));
        buffer.hold(3, "b3");
        buffer.hold(9, "b9");
        assert_eq!(buffer.take_next(5), None);
        assert_eq!(buffer.len(), 1);
        assert!(buffer.timer().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_rearms_timer() {
        let mut buffer = SeqBuffer::new(Duration::from_secs(1));
        buffer.hold(10, 10u64);
        tokio::time::advance(Duration::from_millis(700)).await;
        buffer.hold(12, 12u64);
        tokio::time::advance(Duration::from_millis(700)).await;
        assert!(!buffer.poll(tokio::time::Instant::now()));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(buffer.poll(tokio::time::Instant::now()));

        buffer.clear();
        assert_eq!(buffer.state(), SeqBufferState::Empty);
    }
}
