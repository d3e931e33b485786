//! 與 CA 通訊的客戶端：快取目錄、管理 nonce，並以帳戶金鑰簽名每個 POST 請求。

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    directory::Directory,
    error::{AcmeError, Problem, Result},
    jws::JwsSigner,
    key_pair::KeyPair,
    nonce::{NonceCache, NonceError},
    payload::PayloadT,
    transport::{HttpResponse, HttpTransport},
};

/// 成功（2xx）的 CA 回應。
#[derive(Debug, Clone, PartialEq)]
pub struct AcmeResponse {
    pub status: u16,
    /// 新建立資源的 URL，例如帳戶或訂單。
    pub location: Option<String>,
    /// CA 建議的下次輪詢間隔。
    pub retry_after: Option<Duration>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl AcmeResponse {
    fn from_http(response: HttpResponse) -> Self {
        let retry_after = response
            .retry_after
            .as_deref()
            .and_then(|value| parse_retry_after(value, Utc::now()));
        Self {
            status: response.status,
            location: response.location,
            retry_after,
            content_type: response.content_type,
            body: response.body,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 取得 `Location`，缺少時視為 CA 回應不完整。
    pub fn require_location(&self, what: &str) -> Result<String> {
        self.location.clone().ok_or_else(|| {
            AcmeError::UnexpectedResponse(format!("{} response has no Location header", what))
        })
    }
}

/// 解析 `Retry-After`：秒數或 HTTP-date。已過去的日期視為零。
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        date.with_timezone(&Utc)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// ACME 客戶端。
///
/// 客戶端可在多個執行緒間共用：目錄與帳戶 URL 只設定一次，
/// nonce 快取由 [`NonceCache`] 同步。
#[derive(Debug)]
pub struct AcmeClient<'a> {
    transport: Arc<dyn HttpTransport>,
    directory_url: String,
    directory: OnceLock<Directory>,
    signer: JwsSigner<'a>,
    nonces: NonceCache,
}

impl<'a> AcmeClient<'a> {
    /// 建立客戶端。
    ///
    /// # 參數
    ///
    /// - `transport`: HTTP 傳輸層。
    /// - `directory_url`: CA 目錄 URL。
    /// - `account_key`: 帳戶金鑰，用於簽名所有請求。
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        directory_url: &str,
        account_key: &'a KeyPair,
    ) -> Self {
        Self {
            transport,
            directory_url: directory_url.to_string(),
            directory: OnceLock::new(),
            signer: JwsSigner::new(account_key),
            nonces: NonceCache::new(),
        }
    }

    pub fn signer(&self) -> &JwsSigner<'a> {
        &self.signer
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// 取得目錄；第一次呼叫時向 CA 下載，之後使用快取。
    pub fn directory(&self) -> Result<&Directory> {
        if let Some(directory) = self.directory.get() {
            return Ok(directory);
        }
        let fetched = Directory::fetch(self, &self.directory_url)?;
        Ok(self.directory.get_or_init(|| fetched))
    }

    /// 不簽名的 GET。ACME 只允許目錄以此方式存取；回應中的 nonce 會被保留。
    pub fn get(&self, url: &str) -> Result<AcmeResponse> {
        let response = self.transport.get(url)?;
        self.remember_nonce(&response);
        if !response.is_success() {
            return Err(AcmeError::from_response(&response));
        }
        Ok(AcmeResponse::from_http(response))
    }

    /// 以帳戶 URL（`kid`）簽名並送出載荷。
    pub fn post<P: PayloadT>(&self, url: &str, payload: &P) -> Result<AcmeResponse> {
        payload.validate()?;
        let body = payload.to_json_string()?;
        self.send_signed(url, body.as_bytes(), false)
    }

    /// POST-as-GET：以空的 payload 讀取資源。
    pub fn post_as_get(&self, url: &str) -> Result<AcmeResponse> {
        self.send_signed(url, b"", false)
    }

    /// 以 `jwk` 簽名送出，用於 new-account。
    pub(crate) fn post_with_jwk<P: PayloadT>(&self, url: &str, payload: &P) -> Result<AcmeResponse> {
        payload.validate()?;
        let body = payload.to_json_string()?;
        self.send_signed(url, body.as_bytes(), true)
    }

    /// 取出一個未使用的 nonce；快取為空時以 HEAD new-nonce 取得新的。
    fn fresh_nonce(&self) -> Result<String> {
        let new_nonce_url = &self.directory()?.new_nonce;
        if let Some(nonce) = self.nonces.take() {
            return Ok(nonce);
        }
        let response = self.transport.head(new_nonce_url)?;
        debug!(url = %new_nonce_url, status = response.status, "requested fresh nonce");
        response
            .replay_nonce
            .ok_or_else(|| NonceError::NoNonceHeader(new_nonce_url.clone()).into())
    }

    fn remember_nonce(&self, response: &HttpResponse) {
        if let Some(nonce) = &response.replay_nonce {
            self.nonces.store(nonce.clone());
        }
    }

    /// 簽名並送出；`badNonce` 時以新的 nonce 重送一次，第二次即放棄。
    fn send_signed(&self, url: &str, payload: &[u8], with_jwk: bool) -> Result<AcmeResponse> {
        let mut retried = false;
        loop {
            let nonce = self.fresh_nonce()?;
            let jws = if with_jwk {
                self.signer.sign_with_jwk(payload, url, &nonce)?
            } else {
                self.signer.sign(payload, url, &nonce)?
            };

            let response = self.transport.post_jose(url, &jws.to_json()?)?;
            self.remember_nonce(&response);

            if response.is_success() {
                return Ok(AcmeResponse::from_http(response));
            }

            let error = AcmeError::from_response(&response);
            if error.problem().is_some_and(Problem::is_bad_nonce) && !retried {
                warn!(url, "CA rejected nonce, retrying once with a fresh one");
                retried = true;
                continue;
            }
            debug!(url, status = response.status, error = %error, "CA returned an error");
            return Err(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key_pair::KeyAlgorithm,
        payload::EmptyPayload,
        transport::{Method, MockTransport},
    };
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    const DIR: &str = "https://ca.test/directory";
    const NEW_NONCE: &str = "https://ca.test/new-nonce";

    fn directory_json() -> serde_json::Value {
        json!({
            "newNonce": NEW_NONCE,
            "newAccount": "https://ca.test/new-account",
            "newOrder": "https://ca.test/new-order",
            "revokeCert": "https://ca.test/revoke-cert"
        })
    }

    fn bad_nonce() -> HttpResponse {
        HttpResponse::new(400)
            .with_content_type("application/problem+json")
            .with_body(r#"{"type":"urn:ietf:params:acme:error:badNonce","detail":"stale"}"#)
    }

    /// 第 n 次 POST 回傳 `responses[n]`，每個回應都帶有遞增的 nonce。
    fn scripted(responses: Vec<HttpResponse>) -> Arc<MockTransport> {
        let counter = AtomicUsize::new(0);
        let posts = Mutex::new(responses.into_iter());
        Arc::new(MockTransport::new(move |req| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let response = match req.method {
                Method::Get => HttpResponse::new(200).with_json(&directory_json()),
                Method::Head => HttpResponse::new(200),
                Method::Post => posts
                    .lock()
                    .unwrap()
                    .next()
                    .unwrap_or_else(|| HttpResponse::new(500)),
            };
            Ok(response.with_nonce(format!("nonce-{}", n)))
        }))
    }

    fn sent_nonces(transport: &MockTransport) -> Vec<String> {
        transport
            .requests()
            .iter()
            .filter_map(|r| r.jws())
            .map(|jws| jws.header().unwrap().nonce)
            .collect()
    }

    #[test]
    fn test_directory_is_fetched_once() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = scripted(vec![]);
        let client = AcmeClient::new(transport.clone(), DIR, &key);

        client.directory().unwrap();
        client.directory().unwrap();
        assert_eq!(transport.count(Method::Get, DIR), 1);
    }

    #[test]
    fn test_nonces_are_never_reused() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = scripted(vec![
            HttpResponse::new(200),
            HttpResponse::new(200),
            HttpResponse::new(404).with_body("gone"),
            HttpResponse::new(200),
        ]);
        let client = AcmeClient::new(transport.clone(), DIR, &key);

        client.post("https://ca.test/a", &EmptyPayload::new()).unwrap();
        client.post_as_get("https://ca.test/b").unwrap();
        assert!(client.post_as_get("https://ca.test/c").is_err());
        client.post_as_get("https://ca.test/d").unwrap();

        let nonces = sent_nonces(&transport);
        assert_eq!(nonces.len(), 4);
        let mut unique = nonces.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), nonces.len());
        // 第一個請求使用目錄回應的 nonce，之後都來自前一個回應。
        assert_eq!(transport.count(Method::Head, NEW_NONCE), 0);
        assert_eq!(nonces[0], "nonce-0");
    }

    #[test]
    fn test_directory_nonce_is_used_before_head() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = scripted(vec![HttpResponse::new(200)]);
        let client = AcmeClient::new(transport.clone(), DIR, &key);

        client.directory().unwrap();
        client.post_as_get("https://ca.test/a").unwrap();
        assert_eq!(transport.count(Method::Head, NEW_NONCE), 0);
        assert_eq!(sent_nonces(&transport), vec!["nonce-0".to_string()]);
    }

    #[test]
    fn test_head_is_used_when_directory_has_no_nonce() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = Arc::new(MockTransport::new(|req| match req.method {
            Method::Get => Ok(HttpResponse::new(200).with_json(&directory_json())),
            Method::Head => Ok(HttpResponse::new(200).with_nonce("from-head")),
            Method::Post => Ok(HttpResponse::new(200)),
        }));
        let client = AcmeClient::new(transport.clone(), DIR, &key);

        client.post_as_get("https://ca.test/a").unwrap();
        assert_eq!(transport.count(Method::Head, NEW_NONCE), 1);
        assert_eq!(sent_nonces(&transport), vec!["from-head".to_string()]);
    }

    #[test]
    fn test_unstructured_server_error_is_retryable() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = scripted(vec![HttpResponse::new(503)
            .with_content_type("text/html")
            .with_body("<html>Service Unavailable</html>")]);
        let client = AcmeClient::new(transport.clone(), DIR, &key);

        let err = client
            .post("https://ca.test/new-order", &EmptyPayload::new())
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.problem().is_none());
        assert!(!matches!(err, AcmeError::CaProtocol { .. }));
        assert!(err.to_string().contains("503"));
        assert_eq!(transport.count(Method::Post, "https://ca.test/new-order"), 1);
    }

    #[test]
    fn test_bad_nonce_is_retried_once() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = scripted(vec![bad_nonce(), HttpResponse::new(200).with_body("ok")]);
        let client = AcmeClient::new(transport.clone(), DIR, &key);

        let response = client.post_as_get("https://ca.test/order/1").unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(transport.count(Method::Post, "https://ca.test/order/1"), 2);

        let nonces = sent_nonces(&transport);
        assert_ne!(nonces[0], nonces[1]);
    }

    #[test]
    fn test_second_bad_nonce_is_fatal() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = scripted(vec![bad_nonce(), bad_nonce(), HttpResponse::new(200)]);
        let client = AcmeClient::new(transport.clone(), DIR, &key);

        let err = client.post_as_get("https://ca.test/order/1").unwrap_err();
        assert!(err.problem().unwrap().is_bad_nonce());
        assert_eq!(transport.count(Method::Post, "https://ca.test/order/1"), 2);
    }

    #[test]
    fn test_missing_nonce_header() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = Arc::new(MockTransport::new(|req| match req.method {
            Method::Get => Ok(HttpResponse::new(200).with_json(&directory_json())),
            _ => Ok(HttpResponse::new(200)),
        }));
        let client = AcmeClient::new(transport, DIR, &key);
        let err = client.post_as_get("https://ca.test/x").unwrap_err();
        assert!(matches!(err, AcmeError::Nonce(NonceError::NoNonceHeader(_))));
    }

    #[test]
    fn test_response_metadata_is_surfaced() {
        let key = KeyPair::generate(KeyAlgorithm::EcP256, None).unwrap();
        let transport = scripted(vec![HttpResponse::new(201)
            .with_location("https://ca.test/order/9")
            .with_retry_after("3")]);
        let client = AcmeClient::new(transport, DIR, &key);

        let response = client.post("https://ca.test/new-order", &EmptyPayload::new()).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.location.as_deref(), Some("https://ca.test/order/9"));
        assert_eq!(response.retry_after, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 30).unwrap();
        assert_eq!(parse_retry_after("120", now), Some(Duration::from_secs(120)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }
}
