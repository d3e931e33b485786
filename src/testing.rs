//! 測試用的腳本化 CA，模擬 RFC 8555 伺服器端的狀態變化。

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use serde_json::{json, Value};

use crate::{
    certificate::tests::self_signed_pem,
    client::AcmeClient,
    csr::csr_dns_names,
    error::Problem,
    jws::base64url_decode,
    key_pair::KeyPair,
    responder::MemResponder,
    transport::{HttpResponse, Method, MockRequest, MockTransport},
};

pub(crate) const BASE: &str = "https://ca.test";
pub(crate) const ACCOUNT_URL: &str = "https://ca.test/acct/1";

/// 挑戰被回應後授權的最終結果。
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Valid,
    /// 以 `dns` 錯誤類型與此描述失敗
    Invalid(String),
    /// 永遠停在 pending
    Stuck,
}

struct MockAuthz {
    identifier: String,
    token: String,
    answered: bool,
    polls: usize,
    status: &'static str,
    error: Option<Value>,
    validation_failure: Option<String>,
}

struct MockOrder {
    identifiers: Vec<String>,
    authz_ids: Vec<usize>,
    finalized: bool,
    processing_fetches: usize,
    chain: Option<String>,
}

struct MockAccount {
    status: &'static str,
    contact: Vec<String>,
}

struct CaState {
    nonce_counter: u64,
    outstanding: HashSet<String>,
    nonce_violations: usize,
    reject_nonces: usize,
    account: Option<MockAccount>,
    orders: Vec<MockOrder>,
    authzs: Vec<MockAuthz>,
    responder: Option<(Arc<MemResponder>, String)>,
    offer_http01: bool,
    pending_polls: usize,
    processing_polls: usize,
    outcome: Outcome,
    outcomes: HashMap<String, Outcome>,
    validated: Vec<String>,
    finalized_csr: Option<Vec<u8>>,
    issued_chain: Option<String>,
    revocation: Option<Value>,
}

pub(crate) struct MockCa {
    transport: Arc<MockTransport>,
    state: Arc<Mutex<CaState>>,
}

impl MockCa {
    pub(crate) fn new() -> Self {
        let state = Arc::new(Mutex::new(CaState {
            nonce_counter: 0,
            outstanding: HashSet::new(),
            nonce_violations: 0,
            reject_nonces: 0,
            account: None,
            orders: Vec::new(),
            authzs: Vec::new(),
            responder: None,
            offer_http01: true,
            pending_polls: 0,
            processing_polls: 1,
            outcome: Outcome::Valid,
            outcomes: HashMap::new(),
            validated: Vec::new(),
            finalized_csr: None,
            issued_chain: None,
            revocation: None,
        }));
        let handler_state = state.clone();
        let transport = MockTransport::new(move |req| Ok(handler_state.lock().unwrap().handle(req)));
        Self {
            transport: Arc::new(transport),
            state,
        }
    }

    /// 回應挑戰時檢查 `responder` 上是否已發布 `token.thumbprint`。
    pub(crate) fn with_http01(self, responder: Arc<MemResponder>, thumbprint: String) -> Self {
        self.state.lock().unwrap().responder = Some((responder, thumbprint));
        self
    }

    /// 回應挑戰後，授權維持 pending 的查詢次數。
    pub(crate) fn with_pending_polls(self, polls: usize) -> Self {
        self.state.lock().unwrap().pending_polls = polls;
        self
    }

    pub(crate) fn with_outcome(self, outcome: Outcome) -> Self {
        self.state.lock().unwrap().outcome = outcome;
        self
    }

    /// 只套用在 `identifier` 的授權上，優先於 [`MockCa::with_outcome`]。
    pub(crate) fn with_outcome_for(self, identifier: &str, outcome: Outcome) -> Self {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .insert(identifier.to_string(), outcome);
        self
    }

    /// 授權只提供 dns-01 與 tls-alpn-01。
    pub(crate) fn without_http01(self) -> Self {
        self.state.lock().unwrap().offer_http01 = false;
        self
    }

    /// 接下來 `count` 個簽名請求都回應 badNonce。
    pub(crate) fn reject_next_nonces(&self, count: usize) {
        self.state.lock().unwrap().reject_nonces = count;
    }

    pub(crate) fn client<'k>(&self, key: &'k KeyPair) -> AcmeClient<'k> {
        AcmeClient::new(self.transport.clone(), &self.url("/directory"), key)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", BASE, path)
    }

    pub(crate) fn requests(&self) -> Vec<MockRequest> {
        self.transport.requests()
    }

    pub(crate) fn count(&self, method: Method, url: &str) -> usize {
        self.transport.count(method, url)
    }

    /// 使用了未發出或已用過 nonce 的請求數。
    pub(crate) fn nonce_violations(&self) -> usize {
        self.state.lock().unwrap().nonce_violations
    }

    /// 回應挑戰時驗證成功的 token。
    pub(crate) fn validated_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().validated.clone()
    }

    pub(crate) fn finalized_csr(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().finalized_csr.clone()
    }

    pub(crate) fn issued_chain(&self) -> Option<String> {
        self.state.lock().unwrap().issued_chain.clone()
    }

    pub(crate) fn revocation(&self) -> Option<Value> {
        self.state.lock().unwrap().revocation.clone()
    }
}

fn problem(status: u16, kind: &str, detail: &str) -> HttpResponse {
    HttpResponse::new(status)
        .with_content_type("application/problem+json")
        .with_body(
            json!({
                "type": format!("{}{}", Problem::ACME_PREFIX, kind),
                "detail": detail,
                "status": status,
            })
            .to_string(),
        )
}

fn path_id(path: &str, prefix: &str) -> Option<usize> {
    path.strip_prefix(prefix)?.parse::<usize>().ok()?.checked_sub(1)
}

impl CaState {
    fn handle(&mut self, req: &MockRequest) -> HttpResponse {
        let path = req.url.strip_prefix(BASE).unwrap_or(&req.url).to_string();
        match (req.method, path.as_str()) {
            (Method::Get, "/directory") => HttpResponse::new(200).with_json(&json!({
                "newNonce": format!("{BASE}/new-nonce"),
                "newAccount": format!("{BASE}/new-account"),
                "newOrder": format!("{BASE}/new-order"),
                "revokeCert": format!("{BASE}/revoke-cert"),
                "keyChange": format!("{BASE}/key-change"),
                "meta": {"termsOfService": format!("{BASE}/terms")}
            })),
            (Method::Head, "/new-nonce") => self.reply(HttpResponse::new(200)),
            (Method::Post, _) => {
                let response = self.handle_post(req, &path);
                self.reply(response)
            }
            _ => HttpResponse::new(404),
        }
    }

    fn reply(&mut self, response: HttpResponse) -> HttpResponse {
        self.nonce_counter += 1;
        let nonce = format!("nonce-{}", self.nonce_counter);
        self.outstanding.insert(nonce.clone());
        response.with_nonce(nonce)
    }

    fn handle_post(&mut self, req: &MockRequest, path: &str) -> HttpResponse {
        let Some(jws) = req.jws() else {
            return problem(400, "malformed", "body is not a JWS");
        };
        let Ok(header) = jws.header() else {
            return problem(400, "malformed", "invalid protected header");
        };
        if !self.outstanding.remove(&header.nonce) {
            self.nonce_violations += 1;
            return problem(400, "badNonce", "JWS has an invalid anti-replay nonce");
        }
        if self.reject_nonces > 0 {
            self.reject_nonces -= 1;
            return problem(400, "badNonce", "JWS has an invalid anti-replay nonce");
        }
        if header.url != req.url {
            return problem(401, "unauthorized", "JWS header URL does not match request");
        }
        let payload = match jws.payload_bytes() {
            Ok(bytes) if bytes.is_empty() => Value::Null,
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(_) => return problem(400, "malformed", "payload is not JSON"),
            },
            Err(_) => return problem(400, "malformed", "payload is not base64url"),
        };

        if path == "/new-account" {
            if header.jwk.is_none() || header.kid.is_some() {
                return problem(400, "malformed", "new-account must be signed with jwk");
            }
            return self.new_account(&payload);
        }

        if header.kid.as_deref() != Some(ACCOUNT_URL) || header.jwk.is_some() {
            return problem(400, "malformed", "request must be signed with kid");
        }
        match &self.account {
            Some(account) if account.status == "valid" => {}
            Some(account) => {
                let detail = format!("Account is not valid, has status {:?}", account.status);
                return problem(403, "unauthorized", &detail);
            }
            None => return problem(400, "accountDoesNotExist", "no such account"),
        }

        if path == "/acct/1" {
            return self.update_account(&payload);
        }
        if path == "/new-order" {
            return self.new_order(&payload);
        }
        if path == "/revoke-cert" {
            self.revocation = Some(payload);
            return HttpResponse::new(200);
        }
        if let Some(rest) = path.strip_prefix("/order/") {
            if let Some(id) = rest.strip_suffix("/finalize").and_then(|id| path_id(id, "")) {
                return self.finalize(id, &payload);
            }
            if let Some(id) = path_id(rest, "") {
                return self.fetch_order(id);
            }
        }
        if let Some(id) = path_id(path, "/authz/") {
            return self.fetch_authz(id);
        }
        if let Some(id) = path_id(path, "/chall/") {
            return self.answer(id);
        }
        if let Some(id) = path_id(path, "/cert/") {
            return match self.orders.get(id).and_then(|o| o.chain.clone()) {
                Some(chain) => HttpResponse::new(200)
                    .with_content_type("application/pem-certificate-chain")
                    .with_body(chain),
                None => problem(404, "malformed", "no such certificate"),
            };
        }
        problem(404, "malformed", "unknown resource")
    }

    fn account_json(&self) -> Value {
        let account = self.account.as_ref();
        json!({
            "status": account.map(|a| a.status).unwrap_or("valid"),
            "contact": account.map(|a| a.contact.clone()).unwrap_or_default(),
            "termsOfServiceAgreed": true,
            "orders": format!("{ACCOUNT_URL}/orders"),
        })
    }

    fn new_account(&mut self, payload: &Value) -> HttpResponse {
        let status = if self.account.is_some() {
            200
        } else {
            let contact: Vec<String> = payload["contact"]
                .as_array()
                .map(|c| c.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            self.account = Some(MockAccount {
                status: "valid",
                contact,
            });
            201
        };
        HttpResponse::new(status)
            .with_location(ACCOUNT_URL)
            .with_json(&self.account_json())
    }

    fn update_account(&mut self, payload: &Value) -> HttpResponse {
        if let Some(account) = self.account.as_mut() {
            if payload["status"] == "deactivated" {
                account.status = "deactivated";
            }
            if let Some(contact) = payload["contact"].as_array() {
                account.contact = contact
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }
        HttpResponse::new(200).with_json(&self.account_json())
    }

    fn new_order(&mut self, payload: &Value) -> HttpResponse {
        let Some(identifiers) = payload["identifiers"].as_array() else {
            return problem(400, "malformed", "missing identifiers");
        };
        let identifiers: Vec<String> = identifiers
            .iter()
            .filter_map(|i| i["value"].as_str().map(str::to_string))
            .collect();

        let mut authz_ids = Vec::new();
        for identifier in &identifiers {
            let id = self.authzs.len();
            let token = if id == 0 {
                "abc123".to_string()
            } else {
                format!("token{}", id + 1)
            };
            self.authzs.push(MockAuthz {
                identifier: identifier.clone(),
                token,
                answered: false,
                polls: 0,
                status: "pending",
                error: None,
                validation_failure: None,
            });
            authz_ids.push(id);
        }

        let id = self.orders.len();
        self.orders.push(MockOrder {
            identifiers,
            authz_ids,
            finalized: false,
            processing_fetches: 0,
            chain: None,
        });
        HttpResponse::new(201)
            .with_location(format!("{BASE}/order/{}", id + 1))
            .with_json(&self.order_json(id))
    }

    fn order_status(&self, id: usize) -> &'static str {
        let order = &self.orders[id];
        if order.finalized {
            return if order.processing_fetches >= self.processing_polls {
                "valid"
            } else {
                "processing"
            };
        }
        let statuses: Vec<_> = order.authz_ids.iter().map(|&a| self.authzs[a].status).collect();
        if statuses.contains(&"invalid") {
            "invalid"
        } else if statuses.iter().all(|s| *s == "valid") {
            "ready"
        } else {
            "pending"
        }
    }

    fn order_json(&self, id: usize) -> Value {
        let order = &self.orders[id];
        let status = self.order_status(id);
        let mut value = json!({
            "status": status,
            "expires": "2030-01-01T00:00:00Z",
            "identifiers": order
                .identifiers
                .iter()
                .map(|v| json!({"type": "dns", "value": v}))
                .collect::<Vec<_>>(),
            "authorizations": order
                .authz_ids
                .iter()
                .map(|a| format!("{BASE}/authz/{}", a + 1))
                .collect::<Vec<_>>(),
            "finalize": format!("{BASE}/order/{}/finalize", id + 1),
        });
        if status == "valid" {
            value["certificate"] = json!(format!("{BASE}/cert/{}", id + 1));
        }
        if status == "invalid" {
            value["error"] = json!({
                "type": format!("{}unauthorized", Problem::ACME_PREFIX),
                "detail": "an authorization failed",
            });
        }
        value
    }

    fn fetch_order(&mut self, id: usize) -> HttpResponse {
        let Some(order) = self.orders.get_mut(id) else {
            return problem(404, "malformed", "no such order");
        };
        if order.finalized {
            order.processing_fetches += 1;
        }
        HttpResponse::new(200).with_json(&self.order_json(id))
    }

    fn finalize(&mut self, id: usize, payload: &Value) -> HttpResponse {
        if id >= self.orders.len() {
            return problem(404, "malformed", "no such order");
        }
        if self.order_status(id) != "ready" {
            return problem(403, "orderNotReady", "order is not ready");
        }
        let Some(csr) = payload["csr"].as_str().and_then(|c| base64url_decode(c).ok()) else {
            return problem(400, "badCSR", "missing CSR");
        };
        let Ok(mut names) = csr_dns_names(&csr) else {
            return problem(400, "badCSR", "unparsable CSR");
        };
        let mut expected = self.orders[id].identifiers.clone();
        names.sort();
        expected.sort();
        if names != expected {
            return problem(400, "badCSR", "CSR names do not match the order");
        }

        let chain = format!(
            "{}{}",
            self_signed_pem(&self.orders[id].identifiers[0], 90),
            self_signed_pem("intermediate.test", 365)
        );
        let order = &mut self.orders[id];
        order.finalized = true;
        order.chain = Some(chain.clone());
        self.finalized_csr = Some(csr);
        self.issued_chain = Some(chain);
        HttpResponse::new(200)
            .with_location(format!("{BASE}/order/{}", id + 1))
            .with_json(&self.order_json(id))
    }

    fn challenges_json(&self, id: usize) -> Value {
        let authz = &self.authzs[id];
        let challenge_status = match (authz.status, authz.answered) {
            ("pending", true) => "processing",
            (status, _) => status,
        };
        let mut http = json!({
            "type": "http-01",
            "url": format!("{BASE}/chall/{}", id + 1),
            "status": challenge_status,
            "token": authz.token,
        });
        if let Some(error) = &authz.error {
            http["error"] = error.clone();
        }
        let dns = json!({
            "type": "dns-01",
            "url": format!("{BASE}/chall-dns/{}", id + 1),
            "status": "pending",
            "token": authz.token,
        });
        let alpn = json!({
            "type": "tls-alpn-01",
            "url": format!("{BASE}/chall-alpn/{}", id + 1),
            "status": "pending",
            "token": authz.token,
        });
        if self.offer_http01 {
            json!([dns, http, alpn])
        } else {
            json!([dns, alpn])
        }
    }

    fn fetch_authz(&mut self, id: usize) -> HttpResponse {
        let pending_polls = self.pending_polls;
        let outcome = self
            .authzs
            .get(id)
            .and_then(|a| self.outcomes.get(&a.identifier))
            .unwrap_or(&self.outcome)
            .clone();
        let Some(authz) = self.authzs.get_mut(id) else {
            return problem(404, "malformed", "no such authorization");
        };
        if authz.answered && authz.status == "pending" {
            authz.polls += 1;
            if authz.polls > pending_polls {
                match (&authz.validation_failure, outcome) {
                    (Some(detail), _) => {
                        authz.status = "invalid";
                        authz.error = Some(json!({
                            "type": format!("{}unauthorized", Problem::ACME_PREFIX),
                            "detail": detail,
                        }));
                    }
                    (None, Outcome::Valid) => authz.status = "valid",
                    (None, Outcome::Invalid(detail)) => {
                        authz.status = "invalid";
                        authz.error = Some(json!({
                            "type": format!("{}dns", Problem::ACME_PREFIX),
                            "detail": detail,
                        }));
                    }
                    (None, Outcome::Stuck) => {}
                }
            }
        }
        let authz = &self.authzs[id];
        HttpResponse::new(200).with_json(&json!({
            "identifier": {"type": "dns", "value": authz.identifier},
            "status": authz.status,
            "expires": "2030-01-01T00:00:00Z",
            "challenges": self.challenges_json(id),
        }))
    }

    fn answer(&mut self, id: usize) -> HttpResponse {
        if id >= self.authzs.len() || !self.offer_http01 {
            return problem(404, "malformed", "no such challenge");
        }
        let (token, identifier) = {
            let authz = &self.authzs[id];
            (authz.token.clone(), authz.identifier.clone())
        };
        if let Some((responder, thumbprint)) = &self.responder {
            let expected = format!("{}.{}", token, thumbprint);
            if responder.get(&token).as_deref() == Some(expected.as_str()) {
                self.validated.push(token.clone());
            } else {
                self.authzs[id].validation_failure = Some(format!(
                    "Invalid response from http://{}/.well-known/acme-challenge/{}",
                    identifier, token
                ));
            }
        }
        self.authzs[id].answered = true;

        let challenge = self
            .challenges_json(id)
            .as_array()
            .and_then(|c| c.iter().find(|c| c["type"] == "http-01").cloned())
            .unwrap_or(Value::Null);
        HttpResponse::new(200).with_json(&challenge)
    }
}
