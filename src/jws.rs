//! 此模組提供 JSON Web Signature (JWS) 的建立與簽名。
//!
//! ACME 的每個 POST 請求都是一個 flattened JSON 序列化的 JWS，
//! protected header 內帶有 nonce、目標 URL 以及 `jwk` 或 `kid`。

use std::sync::OnceLock;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    key_pair::{KeyError, KeyPair},
    protection::{KeyIdentity, ProtectedHeader},
};

/// 表示與 JWS 相關的錯誤。
#[derive(Error, Debug)]
pub enum JwsError {
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Key error: {0}")]
    KeyError(#[from] KeyError),
}

type Result<T> = std::result::Result<T, JwsError>;

/// 以無填充的 URL-safe Base64 編碼資料。
pub fn base64url<T: AsRef<[u8]>>(input: T) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// 解碼無填充的 URL-safe Base64 字串。
pub fn base64url_decode(input: &str) -> Result<Vec<u8>> {
    Ok(URL_SAFE_NO_PAD.decode(input)?)
}

/// 表示一個 JSON Web Signature (JWS) 物件，各欄位皆為 base64url 字串。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl Jws {
    /// 將 `Jws` 實例序列化為 JSON 格式的字串。
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 解碼並回傳 protected header。
    pub fn header(&self) -> Result<ProtectedHeader> {
        Ok(serde_json::from_slice(&base64url_decode(&self.protected)?)?)
    }

    /// 解碼後的 payload 原始位元組；POST-as-GET 時為空。
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        base64url_decode(&self.payload)
    }

    /// 簽名輸入 `protected.payload`。
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.protected, self.payload)
    }

    /// 解碼後的簽名。
    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        base64url_decode(&self.signature)
    }
}

/// 持有帳戶金鑰的簽名者。
///
/// 帳戶 URL（`kid`）在註冊或讀回帳戶資源後才會設定，且只設定一次；
/// 設定前所有請求在 header 中附帶 `jwk`，設定後只附帶 `kid`。
#[derive(Debug)]
pub struct JwsSigner<'a> {
    key: &'a KeyPair,
    kid: OnceLock<String>,
}

impl<'a> JwsSigner<'a> {
    pub fn new(key: &'a KeyPair) -> Self {
        Self {
            key,
            kid: OnceLock::new(),
        }
    }

    /// 帳戶金鑰。
    pub fn key(&self) -> &'a KeyPair {
        self.key
    }

    /// 設定帳戶 URL。已設定過時回傳 `false` 並保留原值。
    pub fn set_kid(&self, kid: impl Into<String>) -> bool {
        self.kid.set(kid.into()).is_ok()
    }

    /// 目前的帳戶 URL。
    pub fn kid(&self) -> Option<&str> {
        self.kid.get().map(String::as_str)
    }

    /// 以目前身分簽名：有 `kid` 時使用 `kid`，否則使用 `jwk`。
    ///
    /// # 參數
    ///
    /// - `payload`: 已序列化的 payload；POST-as-GET 請傳入空切片。
    /// - `url`: 請求目標 URL，必須與實際送出的 URL 相同。
    /// - `nonce`: 呼叫端剛取得、尚未使用過的 nonce。
    pub fn sign(&self, payload: &[u8], url: &str, nonce: &str) -> Result<Jws> {
        let identity = match self.kid() {
            Some(kid) => KeyIdentity::Kid(kid.to_string()),
            None => KeyIdentity::Jwk(self.key.jwk()?.to_value().map_err(KeyError::from)?),
        };
        self.sign_as(identity, payload, url, nonce)
    }

    /// 無論是否已有 `kid`，都以 `jwk` 簽名。用於 new-account 請求。
    pub fn sign_with_jwk(&self, payload: &[u8], url: &str, nonce: &str) -> Result<Jws> {
        let jwk = self.key.jwk()?.to_value().map_err(KeyError::from)?;
        self.sign_as(KeyIdentity::Jwk(jwk), payload, url, nonce)
    }

    fn sign_as(&self, identity: KeyIdentity, payload: &[u8], url: &str, nonce: &str) -> Result<Jws> {
        let header = ProtectedHeader::new(self.key.jws_algorithm(), nonce, url, identity);
        let protected = base64url(header.to_json()?);
        let payload = base64url(payload);

        let signing_input = format!("{}.{}", protected, payload);
        let signature = base64url(self.key.sign(signing_input.as_bytes())?);

        Ok(Jws {
            protected,
            payload,
            signature,
        })
    }
}
