//! HTTP 傳輸層。ACME 流程只透過 [`HttpTransport`] 與 CA 通訊，
//! 預設實作為 reqwest 的阻塞式客戶端，測試則使用 [`MockTransport`]。

use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use reqwest::{blocking::Client, header::HeaderMap};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::jws::Jws;

/// JWS 請求的 Content-Type。
pub const JOSE_CONTENT_TYPE: &str = "application/jose+json";

/// 簽名請求的 Accept；憑證下載端點依此回傳 PEM 憑證鏈。
pub const JOSE_ACCEPT: &str = "application/pem-certificate-chain, application/json";

/// 網路層級的錯誤，可由呼叫端退避重試。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("HTTP {status} without a problem document: {body}")]
    Status { status: u16, body: String },
}

/// CA 回應中 ACME 流程需要的部分。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub replay_nonce: Option<String>,
    pub location: Option<String>,
    pub retry_after: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.replay_nonce = Some(nonce.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: impl Into<String>) -> Self {
        self.retry_after = Some(retry_after.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// 以 JSON 值作為本文。
    pub fn with_json(self, value: &serde_json::Value) -> Self {
        self.with_content_type("application/json")
            .with_body(value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 本文是否為 problem 文件。
    pub fn is_problem(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("application/problem+json"))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// 與 CA 通訊所需的最小 HTTP 能力。
///
/// 實作必須原樣回傳狀態碼、本文以及 `Replay-Nonce`、`Location`、`Retry-After` 標頭，
/// 非 2xx 回應不可轉為錯誤；只有網路層失敗才回傳 [`TransportError`]。
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// 不簽名的 GET，僅用於目錄。
    fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;

    /// HEAD 請求，用於 new-nonce。
    fn head(&self, url: &str) -> Result<HttpResponse, TransportError>;

    /// 以 `application/jose+json` 送出已簽名的 JWS。
    fn post_jose(&self, url: &str, body: &str) -> Result<HttpResponse, TransportError>;
}

/// 以 reqwest 阻塞式客戶端實作的傳輸層。
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 建立傳輸層。
    ///
    /// # 參數
    ///
    /// - `user_agent`: 送往 CA 的 User-Agent。
    /// - `timeout`: 單一請求的逾時時間。
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    fn convert(response: reqwest::blocking::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes()?.to_vec();

        Ok(HttpResponse {
            status,
            replay_nonce: header_value(&headers, "Replay-Nonce"),
            location: header_value(&headers, "Location"),
            retry_after: header_value(&headers, "Retry-After"),
            content_type: header_value(&headers, "Content-Type"),
            body,
        })
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        Self::convert(self.client.get(url).send()?)
    }

    fn head(&self, url: &str) -> Result<HttpResponse, TransportError> {
        Self::convert(self.client.head(url).send()?)
    }

    fn post_jose(&self, url: &str, body: &str) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", JOSE_CONTENT_TYPE)
            .header("Accept", JOSE_ACCEPT)
            .body(body.to_string())
            .send()?;
        Self::convert(response)
    }
}

/// 請求方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
}

/// [`MockTransport`] 記錄下的一個請求。
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
}

impl MockRequest {
    /// 將 POST 本文解析為 JWS。
    pub fn jws(&self) -> Option<Jws> {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_str(body).ok())
    }
}

type MockHandler = dyn Fn(&MockRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// 模擬傳輸層，通常用於測試環境中以腳本回應請求。
///
/// 每個請求都會被記錄，可在測試結束後檢查實際送出的內容。
pub struct MockTransport {
    handler: Box<MockHandler>,
    requests: Mutex<Vec<MockRequest>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("requests", &self.requests().len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// 以處理函式建立模擬傳輸層。
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&MockRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 目前為止收到的所有請求。
    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 指定方法與 URL 的請求次數。
    pub fn count(&self, method: Method, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.url == url)
            .count()
    }

    fn dispatch(
        &self,
        method: Method,
        url: &str,
        body: Option<&str>,
    ) -> Result<HttpResponse, TransportError> {
        let request = MockRequest {
            method,
            url: url.to_string(),
            body: body.map(str::to_string),
        };
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        (self.handler)(&request)
    }
}

impl HttpTransport for MockTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.dispatch(Method::Get, url, None)
    }

    fn head(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.dispatch(Method::Head, url, None)
    }

    fn post_jose(&self, url: &str, body: &str) -> Result<HttpResponse, TransportError> {
        self.dispatch(Method::Post, url, Some(body))
    }
}
