//! 持久化儲存抽象，用於保存帳戶金鑰與帳戶資源等少量檔案。

use std::{
    collections::HashMap,
    fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::{Arc, RwLock},
};

use thiserror::Error;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Key already exists: {0}")]
    AlreadyExists(String),
    #[error("Lock poisoned")]
    LockPoisoned,
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 定義儲存系統所需實現的 API。
///
/// key 一律為以 `/` 分隔的相對路徑，例如 `account.key` 或 `acme/account.json`。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 所對應檔案的內容，不存在時回傳 [`StorageError::NotFound`]。
    fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 將資料寫入指定 key 所對應的檔案中，必要時建立父目錄。
    fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 僅在檔案不存在時寫入；已存在時回傳 [`StorageError::AlreadyExists`]。
    ///
    /// 帳戶金鑰與帳戶資源只允許寫入一次，應使用此方法。
    fn create_file(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.exists(key)? {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }
        self.write_file(key, value)
    }

    /// 刪除指定 key 所對應的檔案，不存在時視為成功。
    fn remove(&self, key: &str) -> Result<()>;

    /// 檢查指定 key 是否存在於儲存系統中。
    fn exists(&self, key: &str) -> Result<bool>;
}

/// 私有工具，提供 key 正規化與驗證。
struct KeyUtils;

impl KeyUtils {
    /// 將 key 正規化為相對路徑，拒絕空字串、控制字元、絕對路徑與 `..`。
    fn normalize(key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        if key.ends_with('/') {
            return Err(StorageError::InvalidKey(format!(
                "File key cannot end with '/': {}",
                key
            )));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::CurDir => {}
                Component::Normal(name) => normalized.push(name),
                _ => {
                    return Err(StorageError::InvalidKey(format!(
                        "Key must be a relative path without '..': {}",
                        key
                    )))
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey(format!("Invalid path: {}", key)));
        }
        Ok(normalized)
    }
}

/// 以目錄為根的檔案儲存實作，每個 key 對應根目錄下的一個普通檔案。
///
/// 在 Unix 上新建的檔案權限為 `0600`，因為帳戶金鑰以未加密形式保存。
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// 開啟（必要時建立）指定的根目錄。
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// 根目錄路徑。
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(KeyUtils::normalize(key)?))
    }

    fn open_for_write(path: &Path) -> io::Result<fs::File> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(path)
    }
}

impl Storage for FileStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // 先寫入暫存檔再 rename，避免中途失敗留下半截金鑰
        let temp_path = path.with_extension("tmp");
        let mut file = Self::open_for_write(&temp_path)?;
        file.write_all(value)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve(key)?.is_file())
    }
}

/// 基於記憶體的儲存實作，適合測試或不需落地的情境。
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    data: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目前保存的檔案數量。
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = KeyUtils::normalize(key)?;
        let data = self.data.read().map_err(|_| StorageError::LockPoisoned)?;
        data.get(&path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(path, value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(&path);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = KeyUtils::normalize(key)?;
        Ok(self
            .data
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains_key(&path))
    }
}
