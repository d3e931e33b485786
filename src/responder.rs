//! HTTP-01 驗證內容的發布。
//!
//! CA 會以純 HTTP 存取 `http://{domain}/.well-known/acme-challenge/{token}`，
//! 發布方式由 [`ChallengeResponder`] 決定；本庫提供寫入 webroot 的
//! [`FileResponder`] 與測試用的 [`MemResponder`]。

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::challenge::{KeyAuthorization, WELL_KNOWN_PREFIX};

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid challenge token: {0:?}")]
    InvalidToken(String),
}

type Result<T> = std::result::Result<T, ResponderError>;

/// 讓 key authorization 可在驗證路徑上被存取的能力。
pub trait ChallengeResponder: Send + Sync {
    /// 發布 `key_authorization`，使其可於 `/.well-known/acme-challenge/{token}` 取得。
    fn publish(&self, token: &str, key_authorization: &str) -> Result<()>;

    /// 移除先前發布的內容。不存在時視為成功。
    fn remove(&self, token: &str) -> Result<()>;
}

/// 已發布的驗證內容；離開作用域時自動移除。
///
/// 無論簽發成功、CA 回報失敗或逾時，驗證內容都會被清除。
pub struct PublishedChallenge<'r> {
    responder: &'r dyn ChallengeResponder,
    token: String,
}

impl<'r> PublishedChallenge<'r> {
    pub fn publish(
        responder: &'r dyn ChallengeResponder,
        key_authorization: &KeyAuthorization,
    ) -> Result<Self> {
        responder.publish(&key_authorization.token, &key_authorization.validation)?;
        debug!(token = %key_authorization.token, "published challenge response");
        Ok(Self {
            responder,
            token: key_authorization.token.clone(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for PublishedChallenge<'_> {
    fn drop(&mut self) {
        match self.responder.remove(&self.token) {
            Ok(()) => debug!(token = %self.token, "removed challenge response"),
            Err(e) => warn!(token = %self.token, error = %e, "failed to remove challenge response"),
        }
    }
}

/// 將驗證內容寫入網站根目錄下的 `.well-known/acme-challenge/`。
#[derive(Debug, Clone)]
pub struct FileResponder {
    webroot: PathBuf,
}

impl FileResponder {
    /// # 參數
    ///
    /// - `webroot`: 由 HTTP 伺服器對外提供的根目錄
    pub fn new<P: AsRef<Path>>(webroot: P) -> Self {
        Self {
            webroot: webroot.as_ref().to_path_buf(),
        }
    }

    /// token 對應的檔案路徑。
    pub fn path_for(&self, token: &str) -> Result<PathBuf> {
        if token.is_empty()
            || !token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ResponderError::InvalidToken(token.to_string()));
        }
        Ok(self
            .webroot
            .join(WELL_KNOWN_PREFIX.trim_start_matches('/'))
            .join(token))
    }
}

impl ChallengeResponder for FileResponder {
    fn publish(&self, token: &str, key_authorization: &str) -> Result<()> {
        let path = self.path_for(token)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, key_authorization)?;
        Ok(())
    }

    fn remove(&self, token: &str) -> Result<()> {
        match fs::remove_file(self.path_for(token)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 記憶體中的發布者，通常用於測試或內嵌的 HTTP 伺服器。
#[derive(Debug, Default)]
pub struct MemResponder {
    published: Mutex<HashMap<String, String>>,
    removed: Mutex<Vec<String>>,
}

impl MemResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 查詢目前發布中的內容，可直接作為 HTTP 回應本文。
    pub fn get(&self, token: &str) -> Option<String> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }

    /// 目前發布中的數量。
    pub fn len(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 曾被移除的 token，依移除順序。
    pub fn removed(&self) -> Vec<String> {
        self.removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChallengeResponder for MemResponder {
    fn publish(&self, token: &str, key_authorization: &str) -> Result<()> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), key_authorization.to_string());
        Ok(())
    }

    fn remove(&self, token: &str) -> Result<()> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
        self.removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.to_string());
        Ok(())
    }
}
