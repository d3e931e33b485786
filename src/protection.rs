use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::signature::JwsAlgorithm;

/// 簽名者在 protected header 中表明身分的方式。
///
/// 註冊帳戶前 CA 尚不認識此金鑰，必須附上完整公鑰（`jwk`）；
/// 註冊後改用帳戶 URL（`kid`）。
#[derive(Debug, Clone, PartialEq)]
pub enum KeyIdentity {
    Jwk(JsonValue),
    Kid(String),
}

/// 表示數字簽章保護頭部的資料結構。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    /// 簽章演算法
    pub alg: String,
    /// 用於防止重放攻擊的隨機數
    pub nonce: String,
    /// 請求目標 URL
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl ProtectedHeader {
    /// 建立新的保護頭。`jwk` 與 `kid` 恰好只會出現其中一個。
    pub fn new(
        alg: JwsAlgorithm,
        nonce: impl Into<String>,
        url: impl Into<String>,
        identity: KeyIdentity,
    ) -> Self {
        let (jwk, kid) = match identity {
            KeyIdentity::Jwk(jwk) => (Some(jwk), None),
            KeyIdentity::Kid(kid) => (None, Some(kid)),
        };

        Self {
            alg: alg.as_str().to_string(),
            nonce: nonce.into(),
            url: url.into(),
            jwk,
            kid,
        }
    }

    /// 序列化為 JSON 字串。
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Display for ProtectedHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        serde_json::to_string(self)
            .map_err(|_| std::fmt::Error)
            .and_then(|s| write!(f, "{}", s))
    }
}
