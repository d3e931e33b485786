use std::{collections::HashSet, result};

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509Req},
};
use thiserror::Error;
use x509_parser::{
    certification_request::X509CertificationRequest, extensions::GeneralName,
    extensions::ParsedExtension, prelude::FromDer,
};

use crate::key_pair::{KeyAlgorithm, KeyError, KeyPair};

/// 域名最大長度（不含結尾的點）。
const MAX_DOMAIN_LEN: usize = 253;
/// 單一標籤最大長度。
const MAX_LABEL_LEN: usize = 63;

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("{0}")]
    InvalidDomain(String),
    #[error("Certificate key error: {0}")]
    Key(#[from] KeyError),
    #[error("Failed to parse CSR: {0}")]
    Parse(String),
}

/// 為簡化錯誤處理定義 Result 類型
type Result<T> = result::Result<T, CsrError>;

/// 檢查並正規化（轉小寫）一組域名。
///
/// 規則：至少一個域名；總長不超過 253；每個標籤 1 到 63 個英數字或連字號，
/// 且不以連字號開頭或結尾；不接受萬用字元；不分大小寫不得重複。
pub fn validate_domains<S: AsRef<str>>(domains: &[S]) -> Result<Vec<String>> {
    if domains.is_empty() {
        return Err(CsrError::InvalidDomain(
            "at least one domain is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(domains.len());
    for domain in domains {
        let domain = domain.as_ref().to_ascii_lowercase();
        check_domain(&domain)?;
        if !seen.insert(domain.clone()) {
            return Err(CsrError::InvalidDomain(format!(
                "duplicate domain: {}",
                domain
            )));
        }
        normalized.push(domain);
    }
    Ok(normalized)
}

fn check_domain(domain: &str) -> Result<()> {
    let invalid = |reason: &str| CsrError::InvalidDomain(format!("{:?}: {}", domain, reason));

    if domain.is_empty() {
        return Err(invalid("empty name"));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("longer than 253 characters"));
    }
    if domain.contains('*') {
        return Err(invalid("wildcard names are not supported"));
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid("each label must be 1-63 characters"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid("labels may only contain letters, digits and '-'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with '-'"));
        }
    }
    Ok(())
}

/// 表示一個 CSR 建構器，主要用於生成包含主體替代名稱 (SAN) 擴展的證書簽名請求。
#[derive(Debug, Default)]
pub struct CSR {
    san_entries: Vec<String>,
}

impl CSR {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一個 DNS 主體替代名稱 (SAN)。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    /// 以憑證金鑰簽署 CSR。SAN 清單會先經過 [`validate_domains`] 檢查。
    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        let domains = validate_domains(&self.san_entries)?;
        let mut req_builder = X509Req::builder()?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &domains {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }
}

/// 產生憑證金鑰（或沿用呼叫端提供的金鑰）與對應的 CSR。
///
/// # 參數
///
/// - `domains`: CSR 的 SAN 清單，會先經過 [`validate_domains`]。
/// - `existing_key_pem`: 沿用的 PKCS#8 PEM 私鑰；`None` 時產生新的。
/// - `alg`, `bits`: 產生新金鑰時使用的演算法與位數。
///
/// # 回傳
///
/// `(私鑰 PEM, DER 編碼的 CSR)`。CSR 由憑證金鑰簽署，與帳戶金鑰無關。
pub fn new_certificate_key_and_csr<S: AsRef<str>>(
    domains: &[S],
    existing_key_pem: Option<&[u8]>,
    alg: KeyAlgorithm,
    bits: Option<u32>,
) -> Result<(String, Vec<u8>)> {
    let domains = validate_domains(domains)?;
    let key_pair = match existing_key_pem {
        Some(pem) => KeyPair::from_pem(pem)?,
        None => KeyPair::generate(alg, bits)?,
    };

    let csr = domains
        .iter()
        .fold(CSR::new(), |csr, domain| csr.set_san(domain))
        .build(&key_pair)?;

    let private_key_pem = String::from_utf8_lossy(&key_pair.to_pem()?).into_owned();
    Ok((private_key_pem, csr.to_der()?))
}

/// 從 DER 編碼的 CSR 取出所有 SAN DNS 名稱。
pub fn csr_dns_names(der: &[u8]) -> Result<Vec<String>> {
    let (_, request) =
        X509CertificationRequest::from_der(der).map_err(|e| CsrError::Parse(e.to_string()))?;

    let mut names = Vec::new();
    if let Some(extensions) = request.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        names.push(dns.to_string());
                    }
                }
            }
        }
    }
    Ok(names)
}

/// CSR 的簽名是否能以 `key` 的公鑰驗證。
pub fn verify_csr_signature(der: &[u8], key: &KeyPair) -> Result<bool> {
    let request = X509Req::from_der(der)?;
    Ok(request.verify(&key.pub_key)?)
}
