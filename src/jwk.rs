use openssl::{
    bn::{BigNum, BigNumContext},
    error::ErrorStack,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    jws::base64url,
    key_pair::{KeyAlgorithm, KeyPair},
};

/// JWK相關操作的錯誤類型。
#[derive(Debug, Error)]
pub enum JwkError {
    /// 金鑰轉換失敗。
    #[error("Failed to convert key: {0}")]
    KeyConversionError(#[from] ErrorStack),
    /// 序列化錯誤。
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// JSON Web Key (JWK) 的封裝，僅包含公開參數。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// RSA 格式的 JWK。
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    /// 橢圓曲線格式的 JWK。
    #[serde(rename = "EC")]
    Ec(EcJwk),
}

/// RSA 公鑰參數。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub n: String,
    pub e: String,
}

/// EC 公鑰參數；`x` 與 `y` 依曲線長度左補零。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub crv: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    /// 根據給定的金鑰對建立對應的 JWK。
    pub fn new(key_pair: &KeyPair) -> Result<Self, JwkError> {
        match key_pair.alg {
            KeyAlgorithm::Rsa => {
                let rsa = key_pair.pub_key.rsa()?;
                Ok(Jwk::Rsa(RsaJwk {
                    n: base64url(rsa.n().to_vec()),
                    e: base64url(rsa.e().to_vec()),
                }))
            }
            KeyAlgorithm::EcP256 => {
                let ec = key_pair.pub_key.ec_key()?;
                let mut ctx = BigNumContext::new()?;
                let mut x = BigNum::new()?;
                let mut y = BigNum::new()?;
                ec.public_key()
                    .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)?;

                Ok(Jwk::Ec(EcJwk {
                    crv: "P-256".to_string(),
                    x: base64url(x.to_vec_padded(32)?),
                    y: base64url(y.to_vec_padded(32)?),
                }))
            }
        }
    }

    /// 產生 RFC 7638 所要求的正規 JSON：僅必要成員、依字典序排列、無空白。
    ///
    /// crate 啟用了 `serde_json` 的 `preserve_order`，因此插入順序即輸出順序。
    pub fn to_acme_json(&self) -> Result<String, JwkError> {
        let mut map = Map::new();
        match self {
            Jwk::Rsa(jwk) => {
                map.insert("e".to_string(), Value::String(jwk.e.clone()));
                map.insert("kty".to_string(), Value::String("RSA".to_string()));
                map.insert("n".to_string(), Value::String(jwk.n.clone()));
            }
            Jwk::Ec(jwk) => {
                map.insert("crv".to_string(), Value::String(jwk.crv.clone()));
                map.insert("kty".to_string(), Value::String("EC".to_string()));
                map.insert("x".to_string(), Value::String(jwk.x.clone()));
                map.insert("y".to_string(), Value::String(jwk.y.clone()));
            }
        }

        serde_json::to_string(&Value::Object(map)).map_err(JwkError::from)
    }

    /// 轉為 JSON 值，供 protected header 的 `jwk` 欄位使用。
    pub fn to_value(&self) -> Result<Value, JwkError> {
        Ok(serde_json::to_value(self)?)
    }
}
