use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    certificate::Certificate,
    client::AcmeClient,
    error::{AcmeError, Problem, Result},
    payload::{FinalizeOrderPayload, Identifier, NewOrderPayload},
};

/// 訂單狀態：pending、ready、processing、valid 與 invalid。
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// 訂單資源。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// 伺服器回傳的訂單 URL（取自 `Location`）
    #[serde(skip)]
    pub url: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    pub identifiers: Vec<Identifier>,
    /// 授權 URL 列表
    pub authorizations: Vec<String>,
    /// 最終確認 URL
    pub finalize: String,
    /// 憑證 URL（僅在有效時存在）
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    /// 最近一次回應中 CA 建議的輪詢間隔
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Order {
    /// 將 `invalid` 訂單轉為錯誤。
    ///
    /// 失敗的識別項取自 problem 或其 subproblems；訂單只有一個識別項時即為該項。
    pub fn failure(&self) -> AcmeError {
        let problem = self
            .error
            .clone()
            .unwrap_or_else(|| Problem::new("orderNotReady", "order is invalid"));
        let identifier = problem
            .identifier
            .as_ref()
            .or_else(|| problem.subproblems.iter().find_map(|sub| sub.identifier.as_ref()))
            .or(match self.identifiers.as_slice() {
                [only] => Some(only),
                _ => None,
            })
            .map(|identifier| identifier.value.clone());
        AcmeError::ca(identifier.as_deref(), problem)
    }
}

/// 向 new-order 端點建立訂單。
///
/// # 參數
///
/// - `client`: 已設定帳戶 URL 的客戶端。
/// - `domains`: 要涵蓋的域名，每個都成為一個 `dns` 識別項。
pub fn create_order<S: AsRef<str>>(client: &AcmeClient<'_>, domains: &[S]) -> Result<Order> {
    let new_order_url = client.directory()?.new_order.clone();
    let response = client.post(&new_order_url, &NewOrderPayload::new(domains))?;

    let mut order: Order = response.json()?;
    order.url = response.require_location("new-order")?;
    order.retry_after = response.retry_after;
    info!(url = %order.url, status = ?order.status, "created order");
    Ok(order)
}

/// 以 POST-as-GET 重新讀取訂單。
pub fn fetch_order(client: &AcmeClient<'_>, url: &str) -> Result<Order> {
    let response = client.post_as_get(url)?;
    let mut order: Order = response.json()?;
    order.url = url.to_string();
    order.retry_after = response.retry_after;
    debug!(url, status = ?order.status, "fetched order");
    Ok(order)
}

/// 送出 CSR 以最終確認訂單，回傳 CA 更新後的訂單。
pub fn finalize_order(client: &AcmeClient<'_>, order: &Order, csr_der: &[u8]) -> Result<Order> {
    if order.status != OrderStatus::Ready {
        return Err(AcmeError::UnexpectedResponse(format!(
            "order {} is {:?}, not ready for finalization",
            order.url, order.status
        )));
    }

    let response = client.post(&order.finalize, &FinalizeOrderPayload::new(csr_der))?;
    let mut updated: Order = response.json()?;
    updated.url = order.url.clone();
    updated.retry_after = response.retry_after;
    info!(url = %order.url, status = ?updated.status, "finalized order");
    Ok(updated)
}

/// 下載已簽發的憑證鏈，回傳終端憑證在前的 PEM 字串。
pub fn download_certificate(client: &AcmeClient<'_>, order: &Order) -> Result<String> {
    let url = match (&order.status, &order.certificate) {
        (OrderStatus::Valid, Some(url)) => url,
        _ => {
            return Err(AcmeError::UnexpectedResponse(format!(
                "order {} has no certificate to download (status {:?})",
                order.url, order.status
            )))
        }
    };

    let response = client.post_as_get(url)?;
    let chain = Certificate::from_pem(&response.text())?;
    info!(url = %url, certificates = chain.chain().len(), "downloaded certificate");
    Ok(chain.to_pem()?)
}
