//! crate 層級的錯誤分類，以及 CA 回傳的 problem 文件（RFC 7807 / RFC 8555 §6.7）。

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    certificate::CertificateError,
    challenge::ChallengeType,
    config::ConfigError,
    csr::CsrError,
    jws::JwsError,
    key_pair::KeyError,
    nonce::NonceError,
    payload::Identifier,
    responder::ResponderError,
    storage::StorageError,
    transport::{HttpResponse, TransportError},
};

/// 所有 ACME 操作回傳的錯誤。
///
/// 呼叫端可依變體決定處理方式：`Transport` 與 `ValidationTimeout` 可用新訂單重試，
/// `CaProtocol` 是 CA 的明確拒絕，其餘多半需要人工介入。
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Failed to load account or certificate key: {0}")]
    KeyIo(#[source] KeyError),
    #[error("Failed to generate key: {0}")]
    KeyGen(#[source] KeyError),
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
    #[error("Account {url} is no longer valid (status: {status})")]
    AccountDeactivated { url: String, status: String },
    #[error("CA does not offer a {challenge_type} challenge for {identifier}")]
    ChallengeTypeUnavailable {
        identifier: String,
        challenge_type: ChallengeType,
    },
    #[error("{}", describe_ca_error(.identifier, .problem))]
    CaProtocol {
        identifier: Option<String>,
        problem: Problem,
    },
    #[error("Timed out after {waited:?} waiting for {stage}")]
    ValidationTimeout { stage: String, waited: Duration },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("JWS error: {0}")]
    Jws(#[from] JwsError),
    #[error("CSR error: {0}")]
    Csr(#[source] CsrError),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("Challenge responder error: {0}")]
    Responder(#[from] ResponderError),
    #[error("Invalid request payload: {0}")]
    InvalidPayload(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// 結果類型，失敗時回傳 [`AcmeError`]。
pub type Result<T> = std::result::Result<T, AcmeError>;

impl AcmeError {
    /// 是否值得由呼叫端以新的訂單退避重試。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ValidationTimeout { .. })
    }

    /// CA 回報的 problem 文件（若有）。
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Self::CaProtocol { problem, .. } => Some(problem),
            _ => None,
        }
    }

    /// 分類非 2xx 回應：problem 文件為 [`AcmeError::CaProtocol`]；
    /// 沒有 problem 的 5xx 與 429 為可重試的 [`AcmeError::Transport`]；其餘為
    /// [`AcmeError::UnexpectedResponse`]。
    pub(crate) fn from_response(response: &HttpResponse) -> Self {
        if let Some(problem) = Problem::parse(response) {
            return Self::ca(None, problem);
        }
        let body = response.text();
        let body = body.trim();
        if response.status >= 500 || response.status == 429 {
            return Self::Transport(TransportError::Status {
                status: response.status,
                body: truncate(body, MAX_ERROR_BODY).to_string(),
            });
        }
        Self::UnexpectedResponse(format!(
            "HTTP {} without a problem document: {}",
            response.status,
            truncate(body, MAX_ERROR_BODY)
        ))
    }

    pub(crate) fn ca(identifier: Option<&str>, problem: Problem) -> Self {
        Self::CaProtocol {
            identifier: identifier.map(str::to_string),
            problem,
        }
    }
}

impl From<KeyError> for AcmeError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Generate(_) | KeyError::KeyTooSmall(_) | KeyError::UnsupportedAlgorithm(_) => {
                Self::KeyGen(e)
            }
            _ => Self::KeyIo(e),
        }
    }
}

impl From<CsrError> for AcmeError {
    fn from(e: CsrError) -> Self {
        match e {
            CsrError::InvalidDomain(reason) => Self::InvalidDomain(reason),
            CsrError::Key(key_error) => Self::from(key_error),
            other => Self::Csr(other),
        }
    }
}

/// 錯誤訊息中保留的回應本文長度。
const MAX_ERROR_BODY: usize = 200;

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn describe_ca_error(identifier: &Option<String>, problem: &Problem) -> String {
    match identifier {
        Some(identifier) => format!("CA rejected {}: {}", identifier, problem),
        None => format!("CA error: {}", problem),
    }
}

/// CA 回傳的結構化錯誤文件。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// 例如 `urn:ietf:params:acme:error:badNonce`
    #[serde(rename = "type", default)]
    pub problem_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Problem>,
}

impl Problem {
    /// ACME 錯誤類型的 URN 前綴。
    pub const ACME_PREFIX: &'static str = "urn:ietf:params:acme:error:";

    /// 以簡短類型建立 problem，例如 `Problem::new("unauthorized", "...")`。
    pub fn new(kind: &str, detail: impl Into<String>) -> Self {
        Self {
            problem_type: format!("{}{}", Self::ACME_PREFIX, kind),
            detail: Some(detail.into()),
            ..Self::default()
        }
    }

    /// 去掉 ACME 前綴後的類型；非 ACME 類型回傳 `None`。
    pub fn kind(&self) -> Option<&str> {
        self.problem_type.strip_prefix(Self::ACME_PREFIX)
    }

    /// 是否為指定的 ACME 錯誤類型。
    pub fn is(&self, kind: &str) -> bool {
        self.kind() == Some(kind)
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.is("badNonce")
    }

    /// 解析非 2xx 回應中的 problem 文件。
    ///
    /// `Content-Type` 為 `application/problem+json`，或本文可解析為帶有 `type` 的
    /// problem 時才回傳；HTML 或純文字的錯誤頁回傳 `None`。
    pub fn parse(response: &HttpResponse) -> Option<Self> {
        match serde_json::from_slice::<Problem>(&response.body) {
            Ok(mut problem) if !problem.problem_type.is_empty() => {
                problem.status.get_or_insert(response.status);
                Some(problem)
            }
            _ if response.is_problem() => {
                let text = response.text();
                Some(Self {
                    problem_type: "about:blank".to_string(),
                    detail: (!text.trim().is_empty()).then(|| text.trim().to_string()),
                    status: Some(response.status),
                    ..Self::default()
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.problem_type)?;
        if let Some(status) = self.status {
            write!(f, " (HTTP {})", status)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        for sub in &self.subproblems {
            match &sub.identifier {
                Some(id) => write!(f, "; [{}] {}", id.value, sub)?,
                None => write!(f, "; {}", sub)?,
            }
        }
        Ok(())
    }
}
