/// 序列追踪器
///
/// 一个计数器（pts / qts / 某频道 pts）对应一个追踪器：
/// - 按 `expected = current + count` 判定应用 / 重复 / 间隙
/// - 间隙时暂存更新并启动宽限定时器
/// - 补齐后按 pts 顺序释放暂存的更新
///
/// 追踪器不关心更新内容，`T` 由调用方决定。

use std::collections::BTreeMap;
use std::time::Duration;

use crate::timer::Timer;
use crate::types::PtsCount;

/// 单条更新的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Apply,
    Duplicate,
    Gap,
}

/// 纯函数判定
pub fn check(current: u64, new_pts: u64, count: u64) -> SequenceCheck {
    let expected = current.saturating_add(count);
    if new_pts == expected {
        SequenceCheck::Apply
    } else if new_pts < expected {
        SequenceCheck::Duplicate
    } else {
        SequenceCheck::Gap
    }
}

/// `update_and_apply` 的结果
#[derive(Debug, PartialEq)]
pub enum TrackOutcome<T> {
    /// 按顺序应用的更新（本条 + 补齐后释放的暂存更新）
    Applied(Vec<T>),
    /// 已经应用过，丢弃
    Duplicate,
    /// 出现间隙，已暂存
    Held,
    /// 正在拉 difference，跳过检查直接应用
    Unchecked(T),
}

pub struct SequenceTracker<T> {
    current: u64,
    inited: bool,
    requesting: bool,
    waiting_for_skipped: bool,
    /// (pts, 到达序号) → 更新；到达序号保证同 pts 的更新按到达顺序排列
    skipped: BTreeMap<(u64, u64), (PtsCount, T)>,
    arrival: u64,
    gap_timer: Timer,
    grace: Duration,
}

impl<T> SequenceTracker<T> {
    pub fn new(grace: Duration) -> Self {
        Self {
            current: 0,
            inited: false,
            requesting: false,
            waiting_for_skipped: false,
            skipped: BTreeMap::new(),
            arrival: 0,
            gap_timer: Timer::new(),
            grace,
        }
    }

    /// 以服务器给出的值重置，丢弃暂存的更新
    pub fn init(&mut self, pts: u64) {
        self.current = pts;
        self.inited = true;
        self.clear_skipped();
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn is_requesting(&self) -> bool {
        self.requesting
    }

    /// 是否有暂存的更新在等待补齐
    pub fn waiting_for_skipped(&self) -> bool {
        self.waiting_for_skipped
    }

    pub fn held_len(&self) -> usize {
        self.skipped.len()
    }

    /// 进入 / 退出 difference 请求状态
    ///
    /// 进入时暂存的更新全部作废，difference 会带回它们。
    pub fn set_requesting(&mut self, requesting: bool) {
        self.requesting = requesting;
        if requesting {
            self.clear_skipped();
        }
    }

    pub fn gap_timer(&self) -> &Timer {
        &self.gap_timer
    }

    pub fn cancel_gap_timer(&mut self) {
        self.gap_timer.cancel();
    }

    /// 宽限期到了且间隙仍未补齐
    pub fn poll_gap(&mut self, now: tokio::time::Instant) -> bool {
        self.gap_timer.fire_if_due(now)
    }

    pub fn update_and_apply(&mut self, pts: PtsCount, item: T) -> TrackOutcome<T> {
        if !self.inited {
            // 还没拿到基准值，采用第一条更新的 pts
            self.init(pts.pts);
            return TrackOutcome::Applied(vec![item]);
        }
        if self.requesting {
            return TrackOutcome::Unchecked(item);
        }

        match check(self.current, pts.pts, pts.count) {
            SequenceCheck::Duplicate => TrackOutcome::Duplicate,
            SequenceCheck::Gap => {
                self.skipped.insert((pts.pts, self.arrival), (pts, item));
                self.arrival += 1;
                self.waiting_for_skipped = true;
                if !self.gap_timer.is_active() {
                    self.gap_timer.call_once(self.grace);
                }
                TrackOutcome::Held
            }
            SequenceCheck::Apply => {
                self.current = pts.pts;
                let mut applied = vec![item];
                self.drain_skipped(&mut applied);
                TrackOutcome::Applied(applied)
            }
        }
    }

    fn drain_skipped(&mut self, applied: &mut Vec<T>) {
        while let Some(entry) = self.skipped.first_entry() {
            let held_pts = entry.get().0;
            match check(self.current, held_pts.pts, held_pts.count) {
                SequenceCheck::Apply => {
                    let (held_pts, item) = entry.remove();
                    self.current = held_pts.pts;
                    applied.push(item);
                }
                SequenceCheck::Duplicate => {
                    entry.remove();
                }
                SequenceCheck::Gap => break,
            }
        }
        if self.skipped.is_empty() {
            self.waiting_for_skipped = false;
            self.gap_timer.cancel();
        }
    }

    fn clear_skipped(&mut self) {
        self.skipped.clear();
        self.waiting_for_skipped = false;
        self.gap_timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker_at(pts: u64) -> SequenceTracker<u64> {
        let mut tracker = SequenceTracker::new(Duration::from_secs(1));
        tracker.init(pts);
        tracker
    }

    #[test]
    fn test_check() {
        assert_eq!(check(100, 101, 1), SequenceCheck::Apply);
        assert_eq!(check(100, 103, 3), SequenceCheck::Apply);
        assert_eq!(check(100, 100, 1), SequenceCheck::Duplicate);
        assert_eq!(check(100, 102, 1), SequenceCheck::Gap);
    }

    #[test]
    fn test_uninited_adopts_first_pts() {
        let mut tracker = SequenceTracker::new(Duration::from_secs(1));
        assert_eq!(
            tracker.update_and_apply(PtsCount::new(50, 1), 50),
            TrackOutcome::Applied(vec![50])
        );
        assert_eq!(tracker.current(), 50);
        assert!(tracker.is_inited());
    }

    #[test]
    fn test_duplicate_is_not_reapplied() {
        let mut tracker = tracker_at(100);
        assert_eq!(
            tracker.update_and_apply(PtsCount::new(101, 1), 101),
            TrackOutcome::Applied(vec![101])
        );
        assert_eq!(
            tracker.update_and_apply(PtsCount::new(101, 1), 101),
            TrackOutcome::Duplicate
        );
        assert_eq!(tracker.current(), 101);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_is_filled_in_order() {
        let mut tracker = tracker_at(100);
        assert_eq!(tracker.update_and_apply(PtsCount::new(103, 1), 103), TrackOutcome::Held);
        assert_eq!(tracker.update_and_apply(PtsCount::new(102, 1), 102), TrackOutcome::Held);
        // 同一 pts 重复到达
        assert_eq!(tracker.update_and_apply(PtsCount::new(102, 1), 999), TrackOutcome::Held);
        assert!(tracker.waiting_for_skipped());
        assert!(tracker.gap_timer().is_active());

        assert_eq!(
            tracker.update_and_apply(PtsCount::new(101, 1), 101),
            TrackOutcome::Applied(vec![101, 102, 103])
        );
        assert_eq!(tracker.current(), 103);
        assert_eq!(tracker.held_len(), 0);
        assert!(!tracker.waiting_for_skipped());
        assert!(!tracker.gap_timer().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_timer_is_not_rearmed() {
        let mut tracker = tracker_at(100);
        tracker.update_and_apply(PtsCount::new(105, 1), 105);
        let first = tracker.gap_timer().deadline();

        tokio::time::advance(Duration::from_millis(400)).await;
        tracker.update_and_apply(PtsCount::new(106, 1), 106);
        assert_eq!(tracker.gap_timer().deadline(), first);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(tracker.poll_gap(tokio::time::Instant::now()));
        assert!(!tracker.poll_gap(tokio::time::Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requesting_clears_and_bypasses() {
        let mut tracker = tracker_at(100);
        tracker.update_and_apply(PtsCount::new(105, 1), 105);
        tracker.set_requesting(true);
        assert_eq!(tracker.held_len(), 0);
        assert!(!tracker.gap_timer().is_active());

        assert_eq!(
            tracker.update_and_apply(PtsCount::new(110, 1), 110),
            TrackOutcome::Unchecked(110)
        );
        assert_eq!(tracker.current(), 100);

        tracker.set_requesting(false);
        tracker.init(110);
        assert_eq!(
            tracker.update_and_apply(PtsCount::new(111, 1), 111),
            TrackOutcome::Applied(vec![111])
        );
    }

    proptest! {
        #[test]
        fn prop_current_never_decreases(
            ops in proptest::collection::vec((0u64..20, 1u64..5), 1..60)
        ) {
            let mut tracker = tracker_at(100);
            let mut last = tracker.current();
            for (offset, count) in ops {
                let pts = 100 + offset;
                if let TrackOutcome::Applied(items) = tracker.update_and_apply(PtsCount::new(pts, count), pts) {
                    for window in items.windows(2) {
                        prop_assert!(window[0] < window[1]);
                    }
                }
                prop_assert!(tracker.current() >= last);
                last = tracker.current();
            }
        }

        #[test]
        fn prop_shuffled_stream_is_applied_in_order(
            order in Just((101u64..=130).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let mut tracker = tracker_at(100);
            let mut applied = Vec::new();
            for pts in order {
                if let TrackOutcome::Applied(items) = tracker.update_and_apply(PtsCount::new(pts, 1), pts) {
                    applied.extend(items);
                }
            }
            prop_assert_eq!(applied, (101u64..=130).collect::<Vec<_>>());
            prop_assert_eq!(tracker.held_len(), 0);
        }
    }
}
