use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private, Public},
    sha::sha256,
    sign::{Signer, Verifier},
};
use std::error::Error;

use crate::key_pair::KeyAlgorithm;

/// ES256 簽名中 r 與 s 各自的固定長度（P-256 為 32 位元組）。
const ES256_COMPONENT_LEN: i32 = 32;

/// 定義簽名操作可能遇到的錯誤類型。
#[derive(Debug)]
pub enum SignatureError {
    /// 簽名過程中發生錯誤，附帶錯誤訊息。
    SigningError(String),
    /// 驗證過程中發生錯誤，附帶錯誤訊息。
    VerificationError(String),
    /// 簽名長度或格式不符合演算法要求。
    MalformedSignature,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignatureError::SigningError(msg) => write!(f, "Signing error: {}", msg),
            SignatureError::VerificationError(msg) => write!(f, "Verification error: {}", msg),
            SignatureError::MalformedSignature => write!(f, "Malformed signature"),
        }
    }
}

impl From<ErrorStack> for SignatureError {
    fn from(e: ErrorStack) -> Self {
        SignatureError::SigningError(e.to_string())
    }
}

impl Error for SignatureError {}

/// JWS 所使用的簽名演算法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlgorithm {
    /// RSASSA-PKCS1-v1_5 + SHA-256
    Rs256,
    /// ECDSA P-256 + SHA-256，簽名為 64 位元組的 r‖s
    Es256,
}

impl JwsAlgorithm {
    /// 根據金鑰演算法選出對應的 JWS 演算法。
    pub fn for_key(alg: KeyAlgorithm) -> Self {
        match alg {
            KeyAlgorithm::Rsa => Self::Rs256,
            KeyAlgorithm::EcP256 => Self::Es256,
        }
    }

    /// 返回 protected header 中 `alg` 欄位的字串。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Es256 => "ES256",
        }
    }

    fn implementation(&self) -> &'static dyn SignatureAlgorithmT {
        match self {
            Self::Rs256 => &RsaSha256,
            Self::Es256 => &EcdsaP256Sha256,
        }
    }
}

/// 定義簽名演算法的介面。
trait SignatureAlgorithmT: Sync {
    fn sign(&self, data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>, SignatureError>;

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        key: &PKey<Public>,
    ) -> Result<bool, SignatureError>;
}

/// RS256 的實作。
struct RsaSha256;

impl SignatureAlgorithmT for RsaSha256 {
    fn sign(&self, data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>, SignatureError> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)?;
        signer.update(data)?;
        Ok(signer.sign_to_vec()?)
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        key: &PKey<Public>,
    ) -> Result<bool, SignatureError> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), key)
            .map_err(|e| SignatureError::VerificationError(e.to_string()))?;
        verifier
            .update(data)
            .map_err(|e| SignatureError::VerificationError(e.to_string()))?;
        verifier
            .verify(signature)
            .map_err(|e| SignatureError::VerificationError(e.to_string()))
    }
}

/// ES256 的實作。
///
/// OpenSSL 產生的是 DER 編碼的 ECDSA 簽名，JWS 要求固定長度的 r‖s，
/// 因此這裡直接使用 [`EcdsaSig`] 操作兩個分量。
struct EcdsaP256Sha256;

impl SignatureAlgorithmT for EcdsaP256Sha256 {
    fn sign(&self, data: &[u8], key: &PKey<Private>) -> Result<Vec<u8>, SignatureError> {
        let digest = sha256(data);
        let ec_key = key.ec_key()?;
        let sig = EcdsaSig::sign(&digest, &ec_key)?;

        let mut raw = sig.r().to_vec_padded(ES256_COMPONENT_LEN)?;
        raw.extend(sig.s().to_vec_padded(ES256_COMPONENT_LEN)?);
        Ok(raw)
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        key: &PKey<Public>,
    ) -> Result<bool, SignatureError> {
        if signature.len() != 2 * ES256_COMPONENT_LEN as usize {
            return Err(SignatureError::MalformedSignature);
        }
        let (r, s) = signature.split_at(ES256_COMPONENT_LEN as usize);
        let to_verification_error = |e: ErrorStack| SignatureError::VerificationError(e.to_string());

        let sig = EcdsaSig::from_private_components(
            BigNum::from_slice(r).map_err(to_verification_error)?,
            BigNum::from_slice(s).map_err(to_verification_error)?,
        )
        .map_err(to_verification_error)?;
        let ec_key = key.ec_key().map_err(to_verification_error)?;

        sig.verify(&sha256(data), &ec_key)
            .map_err(to_verification_error)
    }
}

/// 使用私鑰對資料進行簽名。
pub fn sign(
    alg: JwsAlgorithm,
    data: &[u8],
    key: &PKey<Private>,
) -> Result<Vec<u8>, SignatureError> {
    alg.implementation().sign(data, key)
}

/// 以公鑰驗證簽名，成功時回傳 `true`。
pub fn verify(
    alg: JwsAlgorithm,
    data: &[u8],
    signature: &[u8],
    key: &PKey<Public>,
) -> Result<bool, SignatureError> {
    alg.implementation().verify(data, signature, key)
}
