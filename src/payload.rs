use serde::{Deserialize, Serialize};

use crate::{
    error::{AcmeError, Result},
    jws::base64url,
};

/// 定義所有 API 載荷（Payload）必須實作的功能。
///
/// 實作者需能序列化為 JSON，並在送出前以 [`PayloadT::validate`] 檢查內容。
pub trait PayloadT: Serialize {
    /// 將載荷轉換成 JSON 格式的字串。
    ///
    /// # 錯誤
    ///
    /// 若序列化失敗，則回傳 [`serde_json::Error`]。
    fn to_json_string(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// 驗證載荷資料是否符合預期的規範。
    ///
    /// # 錯誤
    ///
    /// 若驗證失敗，則回傳 [`AcmeError::InvalidPayload`]。
    fn validate(&self) -> Result<()>;
}

fn invalid(reason: &str) -> AcmeError {
    AcmeError::InvalidPayload(reason.to_string())
}

/// 補上 `mailto:` 前綴；已帶有 URI scheme 的聯絡方式保持原樣。
pub fn normalize_contact(contact: &str) -> String {
    if contact.contains(':') {
        contact.to_string()
    } else {
        format!("mailto:{}", contact)
    }
}

/// 表示建立新帳號所需的載荷資料。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
}

impl NewAccountPayload {
    /// 建立已同意服務條款的新帳號載荷。
    ///
    /// 傳入的電子郵件會自動補足 `mailto:` 前綴，若已包含則不重複補充。
    pub fn new(contact: &[String]) -> Self {
        NewAccountPayload {
            contact: contact.iter().map(|c| normalize_contact(c)).collect(),
            terms_of_service_agreed: true,
        }
    }
}

impl PayloadT for NewAccountPayload {
    /// 使用者必須同意服務條款，聯絡資訊不得為空字串。
    fn validate(&self) -> Result<()> {
        if !self.terms_of_service_agreed {
            return Err(invalid("Terms of service must be agreed"));
        }
        let blank = |c: &String| c.split_once(':').map_or(true, |(_, rest)| rest.is_empty());
        if self.contact.iter().any(blank) {
            return Err(invalid("Contact address cannot be empty"));
        }
        Ok(())
    }
}

/// 更新帳戶資源的載荷：修改聯絡資訊或停用帳戶。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl AccountUpdatePayload {
    pub fn contact(contact: &[String]) -> Self {
        Self {
            contact: Some(contact.iter().map(|c| normalize_contact(c)).collect()),
            status: None,
        }
    }

    pub fn deactivate() -> Self {
        Self {
            contact: None,
            status: Some("deactivated".to_string()),
        }
    }
}

impl PayloadT for AccountUpdatePayload {
    fn validate(&self) -> Result<()> {
        match (&self.contact, self.status.as_deref()) {
            (None, None) => Err(invalid("Account update must change contact or status")),
            (_, Some(status)) if status != "deactivated" => {
                Err(invalid("Account status can only be set to 'deactivated'"))
            }
            _ => Ok(()),
        }
    }
}

/// 表示一個識別項，用來描述證書所涵蓋的主機名稱。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    /// 建立類型為 `"dns"` 的識別項。
    pub fn dns(value: &str) -> Self {
        Identifier {
            type_: "dns".to_string(),
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// 表示建立新訂單時所需的載荷資料。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
}

impl NewOrderPayload {
    /// 為每個域名建立類型為 `"dns"` 的識別項。
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        NewOrderPayload {
            identifiers: domains
                .iter()
                .map(|domain| Identifier::dns(domain.as_ref()))
                .collect(),
        }
    }
}

impl PayloadT for NewOrderPayload {
    /// 必須至少包含一個識別項，所有識別項類型為 `"dns"` 且值不得為空。
    fn validate(&self) -> Result<()> {
        if self.identifiers.is_empty() {
            return Err(invalid("At least one identifier is required"));
        }
        for identifier in &self.identifiers {
            if identifier.type_ != "dns" {
                return Err(invalid("Identifier type must be 'dns'"));
            }
            if identifier.value.is_empty() {
                return Err(invalid("Identifier value cannot be empty"));
            }
        }
        Ok(())
    }
}

/// 內容為 `{}` 的載荷，用於回應挑戰與查詢既有帳戶。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyPayload {}

impl EmptyPayload {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadT for EmptyPayload {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// 表示最終化訂單時所需的載荷資料，內含 base64url 編碼的 DER CSR。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    pub csr: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_der: &[u8]) -> Self {
        FinalizeOrderPayload {
            csr: base64url(csr_der),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {
    fn validate(&self) -> Result<()> {
        if self.csr.is_empty() {
            return Err(invalid("CSR cannot be empty"));
        }
        Ok(())
    }
}

/// 撤銷憑證的載荷：base64url 編碼的 DER 終端憑證與撤銷原因代碼。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationPayload {
    pub certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<u8>,
}

impl RevocationPayload {
    pub fn new(leaf_der: &[u8], reason: Option<u8>) -> Self {
        RevocationPayload {
            certificate: base64url(leaf_der),
            reason,
        }
    }
}

impl PayloadT for RevocationPayload {
    /// 原因代碼 7 未被 RFC 5280 使用，超過 10 亦無定義。
    fn validate(&self) -> Result<()> {
        if self.certificate.is_empty() {
            return Err(invalid("Certificate cannot be empty"));
        }
        match self.reason {
            Some(7) | Some(11..) => Err(invalid("Unknown revocation reason code")),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_payload_serialization() {
        let payload = NewAccountPayload::new(&["admin@example.com".to_string()]);
        assert_eq!(
            payload.to_json_string().unwrap(),
            r#"{"contact":["mailto:admin@example.com"],"termsOfServiceAgreed":true}"#
        );
        assert!(payload.validate().is_ok());

        let anonymous = NewAccountPayload::new(&[]);
        assert_eq!(
            anonymous.to_json_string().unwrap(),
            r#"{"termsOfServiceAgreed":true}"#
        );
    }

    #[test]
    fn test_contact_normalization() {
        assert_eq!(normalize_contact("a@b.c"), "mailto:a@b.c");
        assert_eq!(normalize_contact("mailto:a@b.c"), "mailto:a@b.c");
        assert!(NewAccountPayload::new(&["".to_string()]).validate().is_err());
    }

    #[test]
    fn test_new_order_payload() {
        let payload = NewOrderPayload::new(&["example.com", "www.example.com"]);
        assert_eq!(
            payload.to_json_string().unwrap(),
            r#"{"identifiers":[{"type":"dns","value":"example.com"},{"type":"dns","value":"www.example.com"}]}"#
        );
        assert!(payload.validate().is_ok());

        let empty = NewOrderPayload::new::<&str>(&[]);
        assert!(matches!(empty.validate(), Err(AcmeError::InvalidPayload(_))));
    }

    #[test]
    fn test_empty_payload_is_empty_object() {
        assert_eq!(EmptyPayload::new().to_json_string().unwrap(), "{}");
    }

    #[test]
    fn test_account_update_payloads() {
        assert_eq!(
            AccountUpdatePayload::deactivate().to_json_string().unwrap(),
            r#"{"status":"deactivated"}"#
        );
        assert!(AccountUpdatePayload::default().validate().is_err());
        let update = AccountUpdatePayload::contact(&["ops@example.com".to_string()]);
        assert_eq!(update.contact.unwrap(), vec!["mailto:ops@example.com"]);
    }

    #[test]
    fn test_revocation_payload() {
        let payload = RevocationPayload::new(&[0x30, 0x82], Some(0));
        assert_eq!(
            payload.to_json_string().unwrap(),
            r#"{"certificate":"MII","reason":0}"#
        );
        assert!(payload.validate().is_ok());
        assert!(RevocationPayload::new(&[0x30], Some(7)).validate().is_err());
    }
}
