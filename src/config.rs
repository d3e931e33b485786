//! 設定：CA 目錄、聯絡方式、金鑰參數、儲存位置與輪詢時間。

use std::{env, fs, io, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    certificate::{Certificate, CertificateError},
    key_pair::{KeyAlgorithm, MIN_RSA_BITS},
    poll::Deadline,
    transport::{ReqwestTransport, TransportError},
};

/// Let's Encrypt 正式環境目錄。
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt 測試環境目錄。
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// 客戶端設定。JSON 中未出現的欄位使用預設值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// CA 目錄 URL
    pub directory_url: String,
    /// 帳戶聯絡方式，例如 `admin@example.com`
    pub contact: Vec<String>,
    /// [`FileStorage`](crate::storage::FileStorage) 的根目錄
    pub storage_path: PathBuf,
    /// 帳戶私鑰在儲存中的路徑
    pub account_key_path: String,
    /// 帳戶資源 JSON 在儲存中的路徑
    pub account_path: String,
    pub account_key_alg: KeyAlgorithm,
    pub account_key_bits: u32,
    pub cert_key_alg: KeyAlgorithm,
    pub cert_key_bits: u32,
    /// 剩餘天數低於此值時建議續期
    pub renew_before_days: u32,
    /// 單次簽發的總期限（秒）
    pub issuance_timeout_secs: u64,
    /// CA 未提供 `Retry-After` 時的輪詢間隔（毫秒）
    pub poll_interval_ms: u64,
    /// 單一 HTTP 請求的逾時（秒）
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl AcmeConfig {
    /// 預設的密鑰算法。
    pub const DEFAULT_KEY_ALG: KeyAlgorithm = KeyAlgorithm::Rsa;
    /// 預設的密鑰位數。
    pub const DEFAULT_KEY_BITS: u32 = 2048;
    pub const DEFAULT_ISSUANCE_TIMEOUT_SECS: u64 = 90;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
    pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_RENEW_BEFORE_DAYS: u32 = 30;

    /// Let's Encrypt 正式環境的設定。
    pub fn lets_encrypt(contact: &[&str]) -> Self {
        Self {
            contact: contact.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Let's Encrypt 測試環境的設定。
    pub fn lets_encrypt_staging(contact: &[&str]) -> Self {
        Self {
            directory_url: LETS_ENCRYPT_STAGING.to_string(),
            ..Self::lets_encrypt(contact)
        }
    }

    pub fn builder() -> AcmeConfigBuilder {
        AcmeConfigBuilder::new()
    }

    /// 從 JSON 字串載入設定並檢查。
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 從 JSON 檔案載入設定並檢查。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// 檢查設定值是否合理。
    pub fn validate(&self) -> Result<()> {
        if !(self.directory_url.starts_with("https://") || self.directory_url.starts_with("http://"))
        {
            return Err(ConfigError::Invalid(format!(
                "directory_url must be an http(s) URL: {:?}",
                self.directory_url
            )));
        }
        for (alg, bits) in [
            (self.account_key_alg, self.account_key_bits),
            (self.cert_key_alg, self.cert_key_bits),
        ] {
            if alg == KeyAlgorithm::Rsa && bits < MIN_RSA_BITS {
                return Err(ConfigError::Invalid(format!(
                    "RSA keys must be at least 2048 bits, got {}",
                    bits
                )));
            }
        }
        if self.issuance_timeout_secs == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "issuance timeout and poll interval must be positive".to_string(),
            ));
        }
        if self.issuance_timeout_secs > Deadline::MAX_TIMEOUT.as_secs() {
            return Err(ConfigError::Invalid(format!(
                "issuance timeout cannot exceed {} seconds, got {}",
                Deadline::MAX_TIMEOUT.as_secs(),
                self.issuance_timeout_secs
            )));
        }
        if self.poll_interval_ms > self.issuance_timeout_secs.saturating_mul(1000) {
            return Err(ConfigError::Invalid(format!(
                "poll interval ({} ms) is longer than the issuance timeout ({} s)",
                self.poll_interval_ms, self.issuance_timeout_secs
            )));
        }
        if self.http_timeout_secs == 0 || self.http_timeout_secs > Deadline::MAX_TIMEOUT.as_secs() {
            return Err(ConfigError::Invalid(format!(
                "http timeout must be between 1 and {} seconds, got {}",
                Deadline::MAX_TIMEOUT.as_secs(),
                self.http_timeout_secs
            )));
        }
        if self.account_key_path.is_empty() || self.account_path.is_empty() {
            return Err(ConfigError::Invalid(
                "account paths cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn issuance_timeout(&self) -> Duration {
        Duration::from_secs(self.issuance_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// RSA 以外的演算法不需要位數。
    pub fn account_key_bits(&self) -> Option<u32> {
        (self.account_key_alg == KeyAlgorithm::Rsa).then_some(self.account_key_bits)
    }

    pub fn cert_key_bits(&self) -> Option<u32> {
        (self.cert_key_alg == KeyAlgorithm::Rsa).then_some(self.cert_key_bits)
    }

    /// 憑證剩餘有效期是否已低於 `renew_before_days`。
    pub fn needs_renewal(
        &self,
        certificate: &Certificate,
    ) -> std::result::Result<bool, CertificateError> {
        certificate.should_renew(self.renew_before_days)
    }

    /// 依設定建立 reqwest 傳輸層。
    pub fn http_transport(&self) -> std::result::Result<ReqwestTransport, TransportError> {
        ReqwestTransport::new(&self.user_agent, self.http_timeout())
    }

    /// 根據當前環境返回預設的存儲路徑：`$HOME/.local/share/<crate 名稱>`。
    pub fn default_storage_path() -> PathBuf {
        let app_name = env!("CARGO_PKG_NAME");
        let base_dir = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib"));

        base_dir.join(".local/share").join(app_name)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            contact: Vec::new(),
            storage_path: Self::default_storage_path(),
            account_key_path: "account/key.pem".to_string(),
            account_path: "account/account.json".to_string(),
            account_key_alg: Self::DEFAULT_KEY_ALG,
            account_key_bits: Self::DEFAULT_KEY_BITS,
            cert_key_alg: Self::DEFAULT_KEY_ALG,
            cert_key_bits: Self::DEFAULT_KEY_BITS,
            renew_before_days: Self::DEFAULT_RENEW_BEFORE_DAYS,
            issuance_timeout_secs: Self::DEFAULT_ISSUANCE_TIMEOUT_SECS,
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            http_timeout_secs: Self::DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// 用於構建 [`AcmeConfig`] 的構造器，採用 builder 模式。
#[derive(Debug, Clone, Default)]
pub struct AcmeConfigBuilder {
    config: AcmeConfig,
}

impl AcmeConfigBuilder {
    /// 以 [`AcmeConfig::default`] 為起點。
    pub fn new() -> Self {
        Self::default()
    }

    /// 設置 ACME 目錄 URL。
    pub fn directory_url(mut self, url: &str) -> Self {
        self.config.directory_url = url.to_string();
        self
    }

    /// 新增一個聯絡方式。
    pub fn contact(mut self, contact: &str) -> Self {
        self.config.contact.push(contact.to_string());
        self
    }

    /// 設置文件存儲路徑。
    pub fn storage_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.storage_path = path.as_ref().to_path_buf();
        self
    }

    pub fn account_key_path(mut self, path: &str) -> Self {
        self.config.account_key_path = path.to_string();
        self
    }

    pub fn account_path(mut self, path: &str) -> Self {
        self.config.account_path = path.to_string();
        self
    }

    /// 設置帳戶密鑰算法與位數。
    pub fn account_key(mut self, alg: KeyAlgorithm, bits: u32) -> Self {
        self.config.account_key_alg = alg;
        self.config.account_key_bits = bits;
        self
    }

    /// 設置憑證密鑰算法與位數。
    pub fn cert_key(mut self, alg: KeyAlgorithm, bits: u32) -> Self {
        self.config.cert_key_alg = alg;
        self.config.cert_key_bits = bits;
        self
    }

    pub fn renew_before_days(mut self, days: u32) -> Self {
        self.config.renew_before_days = days;
        self
    }

    /// 不足一秒的部分進位到整秒。
    pub fn issuance_timeout(mut self, timeout: Duration) -> Self {
        self.config.issuance_timeout_secs = whole_secs(timeout);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// 不足一秒的部分進位到整秒。
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout_secs = whole_secs(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.config.user_agent = user_agent.to_string();
        self
    }

    /// 檢查並回傳設定。
    pub fn build(self) -> Result<AcmeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn whole_secs(duration: Duration) -> u64 {
    let extra = u64::from(duration.subsec_nanos() > 0);
    duration.as_secs().saturating_add(extra)
}
