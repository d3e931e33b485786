use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    authorization::Authorization,
    client::AcmeClient,
    error::{AcmeError, Problem, Result},
    key_pair::KeyPair,
    payload::EmptyPayload,
};

/// HTTP-01 驗證檔案所在的路徑前綴。
pub const WELL_KNOWN_PREFIX: &str = "/.well-known/acme-challenge/";

/// 表示 ACME 挑戰的類型，可用於選擇相應的驗證策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl ChallengeType {
    /// 返回挑戰類型對應的字串表示。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
            Self::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl FromStr for ChallengeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "http-01" => Ok(Self::Http01),
            "dns-01" => Ok(Self::Dns01),
            "tls-alpn-01" => Ok(Self::TlsAlpn01),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表示 ACME 挑戰的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    /// 判斷該狀態是否為終結狀態，即無法再進行狀態轉換。
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Valid | Self::Invalid)
    }
}

/// 各挑戰類型攜帶的資料。CA 提供但本庫不認得的類型保留原始名稱。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01 { token: String },
    Dns01 { token: String },
    TlsAlpn01 { token: String },
    Unknown { challenge_type: String },
}

impl ChallengeKind {
    /// 已知挑戰類型；未知類型回傳 `None`。
    pub fn challenge_type(&self) -> Option<ChallengeType> {
        match self {
            Self::Http01 { .. } => Some(ChallengeType::Http01),
            Self::Dns01 { .. } => Some(ChallengeType::Dns01),
            Self::TlsAlpn01 { .. } => Some(ChallengeType::TlsAlpn01),
            Self::Unknown { .. } => None,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Http01 { token } | Self::Dns01 { token } | Self::TlsAlpn01 { token } => {
                Some(token)
            }
            Self::Unknown { .. } => None,
        }
    }
}

/// 表示一個 ACME 驗證挑戰。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawChallenge")]
pub struct Challenge {
    pub kind: ChallengeKind,
    /// 回應挑戰時 POST 的 URL
    pub url: String,
    pub status: ChallengeStatus,
    /// 驗證成功的時間
    pub validated: Option<DateTime<Utc>>,
    /// 驗證失敗時 CA 回報的原因
    pub error: Option<Problem>,
}

#[derive(Deserialize)]
struct RawChallenge {
    #[serde(rename = "type")]
    challenge_type: String,
    url: String,
    status: ChallengeStatus,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    validated: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<Problem>,
}

impl From<RawChallenge> for Challenge {
    fn from(raw: RawChallenge) -> Self {
        let kind = match (raw.challenge_type.parse::<ChallengeType>(), raw.token) {
            (Ok(ChallengeType::Http01), Some(token)) => ChallengeKind::Http01 { token },
            (Ok(ChallengeType::Dns01), Some(token)) => ChallengeKind::Dns01 { token },
            (Ok(ChallengeType::TlsAlpn01), Some(token)) => ChallengeKind::TlsAlpn01 { token },
            _ => ChallengeKind::Unknown {
                challenge_type: raw.challenge_type,
            },
        };
        Challenge {
            kind,
            url: raw.url,
            status: raw.status,
            validated: raw.validated,
            error: raw.error,
        }
    }
}

impl Challenge {
    pub fn challenge_type(&self) -> Option<ChallengeType> {
        self.kind.challenge_type()
    }

    pub fn token(&self) -> Option<&str> {
        self.kind.token()
    }
}

/// 回應 HTTP-01 挑戰所需的內容。
#[derive(Debug, Clone, PartialEq)]
pub struct KeyAuthorization {
    pub token: String,
    /// POST 到挑戰 URL 的回應，HTTP-01 為 `{}`。
    pub response: EmptyPayload,
    /// 必須在驗證路徑上提供的內容：`token.thumbprint`。
    pub validation: String,
}

impl KeyAuthorization {
    /// 驗證檔案的 URL 路徑。
    pub fn path(&self) -> String {
        well_known_path(&self.token)
    }
}

/// `/.well-known/acme-challenge/{token}`
pub fn well_known_path(token: &str) -> String {
    format!("{}{}", WELL_KNOWN_PREFIX, token)
}

/// token 只能包含 base64url 字元，以免被當成路徑的一部分。
fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// 從授權中挑出指定類型的挑戰。
///
/// # 錯誤
///
/// CA 未提供此類型時回傳 [`AcmeError::ChallengeTypeUnavailable`]。
pub fn select_challenge(
    authorization: &Authorization,
    challenge_type: ChallengeType,
) -> Result<&Challenge> {
    authorization
        .challenges
        .iter()
        .find(|c| c.challenge_type() == Some(challenge_type))
        .ok_or_else(|| AcmeError::ChallengeTypeUnavailable {
            identifier: authorization.identifier.value.clone(),
            challenge_type,
        })
}

/// 計算挑戰的 key authorization。
///
/// # 參數
///
/// - `challenge`: 要回應的挑戰。
/// - `account_key`: 帳戶金鑰，其 JWK thumbprint 會附在 token 之後。
pub fn compute_key_authorization(
    challenge: &Challenge,
    account_key: &KeyPair,
) -> Result<KeyAuthorization> {
    let token = challenge.token().ok_or_else(|| {
        AcmeError::UnexpectedResponse(format!("challenge {} has no token", challenge.url))
    })?;
    if !is_valid_token(token) {
        return Err(AcmeError::UnexpectedResponse(format!(
            "challenge token {:?} is not base64url",
            token
        )));
    }

    let thumbprint = account_key.thumbprint()?;
    Ok(KeyAuthorization {
        token: token.to_string(),
        response: EmptyPayload::new(),
        validation: format!("{}.{}", token, thumbprint),
    })
}

/// 通知 CA 挑戰已就緒，回傳 CA 更新後的挑戰。
pub fn answer_challenge(
    client: &AcmeClient<'_>,
    challenge: &Challenge,
    key_authorization: &KeyAuthorization,
) -> Result<Challenge> {
    let response = client.post(&challenge.url, &key_authorization.response)?;
    let updated: Challenge = response.json()?;
    info!(url = %challenge.url, status = ?updated.status, "answered challenge");
    Ok(updated)
}
