use std::{fmt, str::FromStr};

use openssl::{
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
    sha::sha256,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    jwk::{Jwk, JwkError},
    jws::base64url,
    signature::{self, JwsAlgorithm, SignatureError},
    storage::{Storage, StorageError},
};

/// RSA 金鑰允許的最小長度。
pub const MIN_RSA_BITS: u32 = 2048;

/// 鍵相關操作的錯誤列舉。
///
/// 其中 `Generate`、`KeyTooSmall` 與 `UnsupportedAlgorithm` 屬於產生失敗，
/// `Parse` 與 `Storage` 屬於讀取失敗，上層據此區分 `KeyGen` 與 `KeyIo`。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    Generate(ErrorStack),
    #[error("Failed to parse private key: {0}")]
    Parse(ErrorStack),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("RSA key of {0} bits is below the 2048-bit minimum")]
    KeyTooSmall(u32),
    #[error("JWK error: {0}")]
    Jwk(#[from] JwkError),
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),
}

type Result<T> = std::result::Result<T, KeyError>;

/// 支援的非對稱金鑰演算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// RSA，簽名使用 RS256。
    Rsa,
    /// NIST P-256 橢圓曲線，簽名使用 ES256。
    EcP256,
}

impl FromStr for KeyAlgorithm {
    type Err = KeyError;

    /// 不區分大小寫地解析演算法名稱。
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "RSA" | "RS256" => Ok(Self::Rsa),
            "EC" | "ECDSA" | "ES256" | "P-256" | "EC-P256" => Ok(Self::EcP256),
            other => Err(KeyError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa => write!(f, "RSA"),
            Self::EcP256 => write!(f, "EC P-256"),
        }
    }
}

/// 表示一組非對稱加密的金鑰對。
pub struct KeyPair {
    /// 金鑰演算法。
    pub alg: KeyAlgorithm,
    /// 私鑰，使用 OpenSSL 的 `PKey` 封裝。
    pub pri_key: PKey<Private>,
    /// 公鑰，從私鑰派生而來。
    pub pub_key: PKey<Public>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("alg", &self.alg)
            .field("bits", &self.pri_key.bits())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// 從儲存讀取私鑰；若不存在則產生新金鑰並以 PKCS#8 PEM 寫入。
    ///
    /// 已存在的檔案永遠不會被覆寫，即使其演算法與 `alg` 不同：
    /// 帳戶金鑰一旦建立就是該安裝唯一的身分。
    ///
    /// # 參數
    ///
    /// - `storage`: 實現了 `Storage` 特性的存儲對象。
    /// - `path`: 私鑰在儲存中的 key。
    /// - `alg`: 產生新金鑰時使用的演算法。
    /// - `bits`: RSA 金鑰長度，未提供時為 2048；EC 金鑰忽略此值。
    ///
    /// # 回傳
    ///
    /// 成功回傳金鑰對；檔案損毀時回傳 [`KeyError::Parse`]，產生失敗時回傳
    /// [`KeyError::Generate`] 或 [`KeyError::KeyTooSmall`]。
    pub fn load_or_create(
        storage: &dyn Storage,
        path: &str,
        alg: KeyAlgorithm,
        bits: Option<u32>,
    ) -> Result<Self> {
        match storage.read_file(path) {
            Ok(pem) => return Self::from_pem(&pem),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(KeyError::Storage(e)),
        }

        let key_pair = Self::generate(alg, bits)?;
        storage.create_file(path, &key_pair.to_pem()?)?;
        info!(path, alg = %alg, "generated new private key");
        Ok(key_pair)
    }

    /// 根據指定演算法產生新的金鑰對。
    pub fn generate(alg: KeyAlgorithm, bits: Option<u32>) -> Result<Self> {
        let pri_key = match alg {
            KeyAlgorithm::Rsa => {
                let bits = bits.unwrap_or(MIN_RSA_BITS);
                if bits < MIN_RSA_BITS {
                    return Err(KeyError::KeyTooSmall(bits));
                }
                let rsa = Rsa::generate(bits).map_err(KeyError::Generate)?;
                PKey::from_rsa(rsa).map_err(KeyError::Generate)?
            }
            KeyAlgorithm::EcP256 => {
                let group =
                    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).map_err(KeyError::Generate)?;
                let ec = EcKey::generate(&group).map_err(KeyError::Generate)?;
                PKey::from_ec_key(ec).map_err(KeyError::Generate)?
            }
        };
        let pub_key = Self::derive_public_key(&pri_key)?;

        Ok(Self {
            alg,
            pri_key,
            pub_key,
        })
    }

    /// 根據 PEM 格式的私鑰資料建立金鑰對，支援 PKCS#8 與傳統格式。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem).map_err(KeyError::Parse)?;
        let alg = Self::detect_algorithm(&pri_key)?;
        let pub_key = Self::derive_public_key(&pri_key)?;

        Ok(Self {
            alg,
            pri_key,
            pub_key,
        })
    }

    /// 以未加密的 PKCS#8 PEM 格式輸出私鑰。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 金鑰長度（位元）。
    pub fn bits(&self) -> u32 {
        self.pri_key.bits()
    }

    /// 此金鑰簽署 JWS 時使用的演算法。
    pub fn jws_algorithm(&self) -> JwsAlgorithm {
        JwsAlgorithm::for_key(self.alg)
    }

    /// 公鑰的 JWK 表示。
    pub fn jwk(&self) -> Result<Jwk> {
        Ok(Jwk::new(self)?)
    }

    /// 計算 RFC 7638 金鑰縮影（thumbprint），以 URL-safe Base64 字串回傳。
    pub fn thumbprint(&self) -> Result<String> {
        let jwk = self.jwk()?;
        let hash = sha256(jwk.to_acme_json()?.as_bytes());
        Ok(base64url(hash))
    }

    /// 使用此金鑰對資料簽名。
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(signature::sign(self.jws_algorithm(), data, &self.pri_key)?)
    }

    fn detect_algorithm(pri_key: &PKey<Private>) -> Result<KeyAlgorithm> {
        match pri_key.id() {
            Id::RSA => Ok(KeyAlgorithm::Rsa),
            Id::EC => {
                let curve = pri_key.ec_key()?.group().curve_name();
                if curve == Some(Nid::X9_62_PRIME256V1) {
                    Ok(KeyAlgorithm::EcP256)
                } else {
                    Err(KeyError::UnsupportedAlgorithm(format!("EC curve {:?}", curve)))
                }
            }
            other => Err(KeyError::UnsupportedAlgorithm(format!("{:?}", other))),
        }
    }

    fn derive_public_key(pri_key: &PKey<Private>) -> Result<PKey<Public>> {
        let der = pri_key.public_key_to_der()?;
        Ok(PKey::public_key_from_der(&der)?)
    }
}
