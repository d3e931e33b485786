//! 有期限、可取消的輪詢。
//!
//! 一次簽發流程只有一個絕對期限，所有輪詢共用；期限一到立即停止，
//! 不會在期限之後再送出任何請求。

use std::{
    sync::{Arc, Condvar, Mutex, PoisonError, Weak},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::error::{AcmeError, Result};

/// 絕對期限。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: Instant,
    at: Instant,
}

impl Deadline {
    /// 可設定的最長期限。
    pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

    /// 從現在起算 `timeout` 後到期；超過 [`Deadline::MAX_TIMEOUT`] 時以上限計算。
    pub fn after(timeout: Duration) -> Self {
        let start = Instant::now();
        let timeout = timeout.min(Self::MAX_TIMEOUT);
        Self {
            start,
            at: start.checked_add(timeout).unwrap_or(start),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// 自建立以來經過的時間。
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn timeout(&self, stage: &str) -> AcmeError {
        AcmeError::ValidationTimeout {
            stage: stage.to_string(),
            waited: self.elapsed(),
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();

        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// 取消訊號。取消時會喚醒所有正在 [`CancelToken::sleep`] 的執行緒，
/// 並一併取消由 [`CancelToken::child`] 建立的子訊號。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 建立子訊號：父訊號取消時子訊號也被取消，反之則否。
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let mut children = self
            .state
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.state));
        }
        child
    }

    /// 睡眠至多 `duration`。被取消時提早返回 `false`。
    pub fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            cancelled = self
                .state
                .wake
                .wait_timeout(cancelled, end - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// 單次查詢的結果。
#[derive(Debug)]
pub enum PollStep<T> {
    /// 已到達終結狀態。
    Done(T),
    /// 尚未完成；可附上 CA 建議的等待時間。
    Pending(Option<Duration>),
}

/// 有期限的輪詢器。
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    deadline: Deadline,
    cancel: CancelToken,
}

impl Poller {
    /// # 參數
    ///
    /// - `interval`: CA 未提供 `Retry-After` 時的等待間隔。
    /// - `deadline`: 共用的絕對期限。
    /// - `cancel`: 取消訊號；被取消時視同期限已到。
    pub fn new(interval: Duration, deadline: Deadline, cancel: CancelToken) -> Self {
        Self {
            interval,
            deadline,
            cancel,
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// 共用期限、使用子取消訊號的輪詢器。
    pub fn child(&self) -> Poller {
        Self::new(self.interval, self.deadline, self.cancel.child())
    }

    /// 重複呼叫 `fetch` 直到回傳 [`PollStep::Done`]。
    ///
    /// 每次查詢前都會檢查期限與取消訊號；等待時間不會超過剩餘期限。
    /// `fetch` 回傳的錯誤立即結束輪詢。
    ///
    /// # 錯誤
    ///
    /// 期限到達或被取消時回傳 [`AcmeError::ValidationTimeout`]。
    pub fn poll_until<T, F>(&self, stage: &str, mut fetch: F) -> Result<T>
    where
        F: FnMut() -> Result<PollStep<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() || self.deadline.is_expired() {
                return Err(self.deadline.timeout(stage));
            }

            attempt += 1;
            let retry_after = match fetch()? {
                PollStep::Done(value) => return Ok(value),
                PollStep::Pending(retry_after) => retry_after,
            };

            let wait = retry_after.unwrap_or(self.interval);
            let remaining = self.deadline.remaining();
            debug!(stage, attempt, ?wait, ?remaining, "still pending");

            if wait >= remaining {
                // 下一次查詢會落在期限之後。
                self.cancel.sleep(remaining);
                return Err(self.deadline.timeout(stage));
            }
            if !self.cancel.sleep(wait) {
                return Err(self.deadline.timeout(stage));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn poller(interval_ms: u64, timeout_ms: u64) -> Poller {
        Poller::new(
            Duration::from_millis(interval_ms),
            Deadline::after(Duration::from_millis(timeout_ms)),
            CancelToken::new(),
        )
    }

    #[test]
    fn test_huge_timeout_is_capped() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() <= Deadline::MAX_TIMEOUT);
        assert!(deadline.remaining() > Deadline::MAX_TIMEOUT - Duration::from_secs(60));
    }

    #[test]
    fn test_n_pending_then_done_takes_n_plus_one_polls() {
        let poller = poller(5, 5_000);
        let mut calls = 0;
        let value = poller
            .poll_until("order", || {
                calls += 1;
                Ok(if calls <= 3 {
                    PollStep::Pending(None)
                } else {
                    PollStep::Done("valid")
                })
            })
            .unwrap();
        assert_eq!(value, "valid");
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_timeout_is_not_earlier_than_deadline() {
        let start = Instant::now();
        let poller = poller(20, 150);
        let mut calls = 0;
        let err = poller
            .poll_until::<(), _>("authorization", || {
                calls += 1;
                Ok(PollStep::Pending(None))
            })
            .unwrap_err();

        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(matches!(err, AcmeError::ValidationTimeout { .. }));
        assert!(err.is_retryable());
        assert!(calls >= 2);
    }

    #[test]
    fn test_retry_after_beyond_deadline_stops_without_extra_fetch() {
        let start = Instant::now();
        let poller = poller(5, 100);
        let mut calls = 0;
        let err = poller
            .poll_until::<(), _>("order", || {
                calls += 1;
                Ok(PollStep::Pending(Some(Duration::from_secs(30))))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(matches!(err, AcmeError::ValidationTimeout { .. }));
    }

    #[test]
    fn test_fetch_error_stops_polling() {
        let poller = poller(5, 5_000);
        let mut calls = 0;
        let err = poller
            .poll_until::<(), _>("order", || {
                calls += 1;
                Err(AcmeError::UnexpectedResponse("boom".into()))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, AcmeError::UnexpectedResponse(_)));
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let token = CancelToken::new();
        let child = token.child();
        let sleeper = thread::spawn(move || child.sleep(Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(!sleeper.join().unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(parent.sleep(Duration::from_millis(1)));

        parent.cancel();
        assert!(parent.child().is_cancelled());
    }
}
