use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    challenge::Challenge,
    client::AcmeClient,
    error::{AcmeError, Problem, Result},
    payload::Identifier,
};

/// 授權狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// 某個識別項的授權，列出可用的挑戰。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Authorization {
    /// 授權資源的 URL（取自請求，不在回應本文中）
    #[serde(skip)]
    pub url: String,
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wildcard: bool,
    /// 最近一次回應中 CA 建議的輪詢間隔
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Authorization {
    /// 第一個帶有錯誤的挑戰所回報的 problem。
    pub fn challenge_error(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }

    /// 將失敗的授權轉為錯誤，帶上識別項與挑戰的錯誤細節。
    pub fn failure(&self) -> AcmeError {
        let problem = self.challenge_error().cloned().unwrap_or_else(|| {
            Problem::new(
                "unauthorized",
                format!("authorization is {:?}", self.status).to_lowercase(),
            )
        });
        AcmeError::ca(Some(&self.identifier.value), problem)
    }
}

/// 以 POST-as-GET 取得授權資源。
pub fn fetch_authorization(client: &AcmeClient<'_>, url: &str) -> Result<Authorization> {
    let response = client.post_as_get(url)?;
    let mut authorization: Authorization = response.json()?;
    authorization.url = url.to_string();
    authorization.retry_after = response.retry_after;
    debug!(
        url,
        identifier = %authorization.identifier,
        status = ?authorization.status,
        "fetched authorization"
    );
    Ok(authorization)
}
