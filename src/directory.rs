use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    client::AcmeClient,
    error::{AcmeError, Result},
};

/// CA 的目錄文件，列出各項操作的端點 URL。
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// 用於取得新的 nonce 值的 API 路徑。
    pub new_nonce: String,
    /// 用於新帳號註冊的 API 路徑。
    pub new_account: String,
    /// 用於建立訂單的 API 路徑。
    pub new_order: String,
    /// 用於撤銷憑證的 API 路徑。
    pub revoke_cert: String,
    /// 用於更換帳戶金鑰的 API 路徑。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,
    /// 預先授權端點，多數 CA 不提供。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,
    /// 用於取得續期資訊的 API 路徑，可能不存在。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

/// 目錄中的中繼資料。
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub external_account_required: bool,
}

impl Directory {
    /// 以不簽名的 GET 取得目錄，回應中的 nonce 留給之後的請求使用。
    ///
    /// # 參數
    ///
    /// - `client`: 發出請求的客戶端。
    /// - `url`: 目錄 URL，例如 Let's Encrypt 的 `https://acme-v02.api.letsencrypt.org/directory`。
    ///
    /// # 回傳
    ///
    /// 成功時回傳 `Directory`；非 2xx 回應依 [`AcmeClient::get`] 的規則分類。
    pub fn fetch(client: &AcmeClient<'_>, url: &str) -> Result<Self> {
        let response = client.get(url)?;
        let directory: Directory = response.json().map_err(|e| {
            AcmeError::UnexpectedResponse(format!("invalid directory document at {}: {}", url, e))
        })?;
        debug!(url, new_order = %directory.new_order, "fetched ACME directory");
        Ok(directory)
    }

    /// CA 的服務條款 URL（若有）。
    pub fn terms_of_service(&self) -> Option<&str> {
        self.meta.as_ref()?.terms_of_service.as_deref()
    }
}
