use chrono::{DateTime, Duration as ChronoDuration, Utc};
use openssl::{asn1::Asn1Time, x509::X509};
use thiserror::Error;

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    #[error("No certificate found in PEM data")]
    Empty,
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

/// 自定義結果型別，錯誤類型為 `CertificateError`
type Result<T> = std::result::Result<T, CertificateError>;

/// PEM 憑證鏈，第一張為終端憑證，其後為中繼憑證。
#[derive(Clone)]
pub struct Certificate {
    chain: Vec<X509>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl Certificate {
    /// 解析 PEM 憑證鏈。
    ///
    /// # 參數
    ///
    /// - `pem`: 一或多張 PEM 憑證，終端憑證在前
    pub fn from_pem(pem: &str) -> Result<Self> {
        let chain = X509::stack_from_pem(pem.as_bytes())?;
        if chain.is_empty() {
            return Err(CertificateError::Empty);
        }
        Ok(Certificate { chain })
    }

    /// 終端憑證。
    pub fn leaf(&self) -> &X509 {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// 終端憑證的 DER 編碼，用於撤銷請求。
    pub fn leaf_der(&self) -> Result<Vec<u8>> {
        Ok(self.leaf().to_der()?)
    }

    /// 依序重新輸出整條憑證鏈。
    pub fn to_pem(&self) -> Result<String> {
        let mut pem = String::new();
        for cert in &self.chain {
            pem.push_str(&String::from_utf8_lossy(&cert.to_pem()?));
        }
        Ok(pem)
    }

    /// 終端憑證的到期時間。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(self.leaf().not_after())?;
        let seconds = diff.days as i64 * 86_400 + diff.secs as i64;
        DateTime::from_timestamp(seconds, 0).ok_or(CertificateError::InvalidTimestamp)
    }

    /// 距離到期的剩餘時間；已過期時為負值。
    pub fn remaining(&self) -> Result<ChronoDuration> {
        Ok(self.not_after()? - Utc::now())
    }

    /// 判斷證書是否應該進行續約
    ///
    /// 剩餘有效時間低於 `threshold_days` 天（或已過期）時回傳 `true`。
    pub fn should_renew(&self, threshold_days: u32) -> Result<bool> {
        Ok(self.remaining()? < ChronoDuration::days(i64::from(threshold_days)))
    }
}
