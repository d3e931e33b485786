use std::sync::{Mutex, PoisonError};

use thiserror::Error;

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當 new-nonce 回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response from {0}")]
    NoNonceHeader(String),
}

/// 最近一次收到的 `Replay-Nonce` 快取。
///
/// 快取最多保存一個 nonce；[`NonceCache::take`] 取出後即清空，
/// 因此同一個 nonce 不可能被兩個請求使用。多個執行緒共用同一個
/// 簽名者時由內部的 `Mutex` 保證取出與寫入的原子性。
#[derive(Debug, Default)]
pub struct NonceCache {
    slot: Mutex<Option<String>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出並清空快取中的 nonce。
    pub fn take(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// 以 CA 回應中的新 nonce 覆寫快取。
    pub fn store(&self, nonce: impl Into<String>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(nonce.into());
    }

    /// 快取是否為空。
    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
