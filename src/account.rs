//! 帳戶金鑰與 CA 帳戶資源的管理。
//!
//! 帳戶金鑰與帳戶資源各自只寫入儲存一次；之後的執行只讀取並向 CA 確認帳戶狀態，
//! 不會重新註冊。

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    client::AcmeClient,
    config::AcmeConfig,
    error::{AcmeError, Result},
    key_pair::KeyPair,
    payload::{AccountUpdatePayload, EmptyPayload, NewAccountPayload, PayloadT},
    storage::{Storage, StorageError},
};

/// 安裝層級的身分：帳戶金鑰。
#[derive(Debug)]
pub struct Identity {
    key: KeyPair,
}

impl Identity {
    /// 讀取帳戶金鑰，不存在時依設定產生並寫入一次。
    ///
    /// # 錯誤
    ///
    /// 檔案損毀或無法讀取時回傳 [`AcmeError::KeyIo`]；產生失敗時回傳 [`AcmeError::KeyGen`]。
    pub fn load_or_create(storage: &dyn Storage, config: &AcmeConfig) -> Result<Self> {
        let key = KeyPair::load_or_create(
            storage,
            &config.account_key_path,
            config.account_key_alg,
            config.account_key_bits(),
        )?;
        Ok(Self { key })
    }

    pub fn from_key(key: KeyPair) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }
}

/// 帳戶狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Deactivated => "deactivated",
            Self::Revoked => "revoked",
        }
    }
}

/// CA 上的帳戶資源。`url` 即後續請求使用的 `kid`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResource {
    #[serde(default)]
    pub url: String,
    pub status: AccountStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

impl AccountResource {
    fn ensure_usable(self) -> Result<Self> {
        match self.status {
            AccountStatus::Valid => Ok(self),
            status => Err(AcmeError::AccountDeactivated {
                url: self.url,
                status: status.as_str().to_string(),
            }),
        }
    }
}

/// 負責建立、讀回與更新帳戶資源。
#[derive(Debug)]
pub struct AccountManager<'s> {
    storage: &'s dyn Storage,
    path: String,
}

impl<'s> AccountManager<'s> {
    /// # 參數
    ///
    /// - `storage`: 保存帳戶資源 JSON 的儲存。
    /// - `path`: 帳戶資源在儲存中的路徑。
    pub fn new(storage: &'s dyn Storage, path: &str) -> Self {
        Self {
            storage,
            path: path.to_string(),
        }
    }

    /// 讀取已保存的帳戶資源。
    pub fn load(&self) -> Result<Option<AccountResource>> {
        match self.storage.read_file(&self.path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 確保帳戶存在且可用，並讓客戶端之後以 `kid` 簽名。
    ///
    /// 已有保存的帳戶時向 CA 查詢一次最新狀態；否則以 new-account 註冊
    /// （同意服務條款），並將帳戶資源寫入儲存。
    ///
    /// # 錯誤
    ///
    /// 帳戶已停用、被撤銷或 CA 不再承認時回傳 [`AcmeError::AccountDeactivated`]，
    /// 不會自動重新註冊。
    pub fn ensure_account(
        &self,
        client: &AcmeClient<'_>,
        contact: &[String],
    ) -> Result<AccountResource> {
        if let Some(stored) = self.load()? {
            Self::bind(client, &stored.url)?;
            let refreshed = Self::query(client, &stored.url)?.ensure_usable()?;
            info!(url = %refreshed.url, "using existing ACME account");
            return Ok(refreshed);
        }

        let new_account_url = client.directory()?.new_account.clone();
        let response =
            client.post_with_jwk(&new_account_url, &NewAccountPayload::new(contact))?;
        let mut account: AccountResource = response.json()?;
        account.url = response.require_location("new-account")?;
        let account = account.ensure_usable()?;

        Self::bind(client, &account.url)?;
        match self
            .storage
            .create_file(&self.path, &serde_json::to_vec_pretty(&account)?)
        {
            Ok(()) | Err(StorageError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(url = %account.url, status = response.status, "registered ACME account");
        Ok(account)
    }

    /// 更新 CA 上的聯絡方式。保存的帳戶資源不會被改寫。
    pub fn update_contact(
        &self,
        client: &AcmeClient<'_>,
        contact: &[String],
    ) -> Result<AccountResource> {
        let updated = Self::update(client, &AccountUpdatePayload::contact(contact))?;
        info!(url = %updated.url, contact = ?updated.contact, "updated account contact");
        Ok(updated)
    }

    /// 停用帳戶。停用後此帳戶金鑰無法再申請憑證。
    pub fn deactivate(&self, client: &AcmeClient<'_>) -> Result<AccountResource> {
        let updated = Self::update(client, &AccountUpdatePayload::deactivate())?;
        warn!(url = %updated.url, "deactivated ACME account");
        Ok(updated)
    }

    /// 讓客戶端以 `url` 作為 `kid`；已綁定其他帳戶時回傳錯誤。
    fn bind(client: &AcmeClient<'_>, url: &str) -> Result<()> {
        if client.signer().set_kid(url) {
            return Ok(());
        }
        match client.signer().kid() {
            Some(current) if current == url => Ok(()),
            current => Err(AcmeError::UnexpectedResponse(format!(
                "client is already bound to account {}, not {}",
                current.unwrap_or("<none>"),
                url
            ))),
        }
    }

    fn account_url(client: &AcmeClient<'_>) -> Result<String> {
        client
            .signer()
            .kid()
            .map(str::to_string)
            .ok_or_else(|| AcmeError::UnexpectedResponse("account is not established".to_string()))
    }

    fn update<P: PayloadT>(client: &AcmeClient<'_>, payload: &P) -> Result<AccountResource> {
        let url = Self::account_url(client)?;
        let mut account: AccountResource = client.post(&url, payload)?.json()?;
        account.url = url;
        Ok(account)
    }

    /// 以 `{}` 查詢帳戶；CA 回報 `unauthorized` 或 `accountDoesNotExist` 時視為帳戶已失效。
    fn query(client: &AcmeClient<'_>, url: &str) -> Result<AccountResource> {
        let response = match client.post(url, &EmptyPayload::new()) {
            Ok(response) => response,
            Err(AcmeError::CaProtocol { problem, .. })
                if problem.is("unauthorized") || problem.is("accountDoesNotExist") =>
            {
                return Err(AcmeError::AccountDeactivated {
                    url: url.to_string(),
                    status: problem.kind().unwrap_or("unknown").to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let mut account: AccountResource = response.json()?;
        account.url = url.to_string();
        Ok(account)
    }
}
