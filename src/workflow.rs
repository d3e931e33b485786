//! 憑證簽發流程：建立訂單、完成 HTTP-01 挑戰、最終確認並下載憑證鏈。
//!
//! 整個流程共用一個絕對期限。多個待驗證的授權在各自的執行緒上同時輪詢，
//! 任一個失敗會取消其餘輪詢；已發布的驗證內容在所有結束路徑上都會被移除。

use std::{
    sync::{Mutex, PoisonError},
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    authorization::{fetch_authorization, AuthorizationStatus},
    certificate::Certificate,
    challenge::{answer_challenge, compute_key_authorization, select_challenge, ChallengeType},
    client::AcmeClient,
    config::AcmeConfig,
    csr::{new_certificate_key_and_csr, validate_domains},
    error::{AcmeError, Result},
    key_pair::KeyAlgorithm,
    order::{create_order, download_certificate, fetch_order, finalize_order, Order, OrderStatus},
    payload::RevocationPayload,
    poll::{CancelToken, Deadline, PollStep, Poller},
    responder::{ChallengeResponder, PublishedChallenge},
};

/// 簽發結果。
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCertificate {
    /// 憑證私鑰（PKCS#8 PEM）
    pub private_key_pem: String,
    /// 終端憑證在前的完整憑證鏈
    pub fullchain_pem: String,
    pub order_url: String,
    /// 正規化後的域名
    pub domains: Vec<String>,
}

impl IssuedCertificate {
    pub fn certificate(&self) -> Result<Certificate> {
        Ok(Certificate::from_pem(&self.fullchain_pem)?)
    }
}

/// 憑證撤銷原因（RFC 5280 §5.3.1）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub fn code(&self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }
}

/// 單次簽發流程的執行者。
///
/// 客戶端必須已由 [`AccountManager::ensure_account`](crate::account::AccountManager::ensure_account)
/// 綁定帳戶。
pub struct OrderWorkflow<'c, 'k> {
    client: &'c AcmeClient<'k>,
    responder: &'c dyn ChallengeResponder,
    timeout: Duration,
    poll_interval: Duration,
    cert_key_alg: KeyAlgorithm,
    cert_key_bits: Option<u32>,
    cancel: CancelToken,
}

impl<'c, 'k> OrderWorkflow<'c, 'k> {
    /// 以預設的期限、輪詢間隔與憑證金鑰參數建立。
    pub fn new(client: &'c AcmeClient<'k>, responder: &'c dyn ChallengeResponder) -> Self {
        Self::from_config(client, responder, &AcmeConfig::default())
    }

    pub fn from_config(
        client: &'c AcmeClient<'k>,
        responder: &'c dyn ChallengeResponder,
        config: &AcmeConfig,
    ) -> Self {
        Self {
            client,
            responder,
            timeout: config.issuance_timeout(),
            poll_interval: config.poll_interval(),
            cert_key_alg: config.cert_key_alg,
            cert_key_bits: config.cert_key_bits(),
            cancel: CancelToken::new(),
        }
    }

    /// 整個簽發流程的期限，上限為 [`Deadline::MAX_TIMEOUT`]。
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(Deadline::MAX_TIMEOUT);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cert_key(mut self, alg: KeyAlgorithm, bits: Option<u32>) -> Self {
        self.cert_key_alg = alg;
        self.cert_key_bits = bits;
        self
    }

    /// 外部取消訊號；取消後進行中的輪詢以 [`AcmeError::ValidationTimeout`] 結束。
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 為 `domains` 簽發憑證。
    ///
    /// # 參數
    ///
    /// - `domains`: 憑證涵蓋的域名，會先檢查格式與重複。
    /// - `cert_key_pem`: 沿用的憑證私鑰；`None` 時產生新的。
    ///
    /// # 錯誤
    ///
    /// 失敗時不會回傳任何部分結果；已發布的驗證內容都會被移除。
    pub fn issue<S: AsRef<str>>(
        &self,
        domains: &[S],
        cert_key_pem: Option<&[u8]>,
    ) -> Result<IssuedCertificate> {
        let domains = validate_domains(domains)?;
        let (private_key_pem, csr_der) = new_certificate_key_and_csr(
            &domains,
            cert_key_pem,
            self.cert_key_alg,
            self.cert_key_bits,
        )?;

        let poller = Poller::new(
            self.poll_interval,
            Deadline::after(self.timeout),
            self.cancel.child(),
        );
        info!(domains = ?domains, timeout = ?self.timeout, "starting certificate issuance");

        let order = create_order(self.client, &domains)?;
        let order = match order.status {
            OrderStatus::Pending => {
                self.authorize(&order, &poller)?;
                self.wait_ready(&order.url, &poller)?
            }
            OrderStatus::Ready => order,
            OrderStatus::Invalid => return Err(order.failure()),
            status => {
                return Err(AcmeError::UnexpectedResponse(format!(
                    "new order {} is already {:?}",
                    order.url, status
                )))
            }
        };

        let order = finalize_order(self.client, &order, &csr_der)?;
        let order = self.wait_valid(order, &poller)?;
        let fullchain_pem = download_certificate(self.client, &order)?;

        info!(
            order = %order.url,
            elapsed = ?poller.deadline().elapsed(),
            "certificate issued"
        );
        Ok(IssuedCertificate {
            private_key_pem,
            fullchain_pem,
            order_url: order.url,
            domains,
        })
    }

    /// 續期即重新簽發一張新憑證；是否需要續期由呼叫端以
    /// [`AcmeConfig::needs_renewal`] 判斷。
    pub fn renew<S: AsRef<str>>(
        &self,
        domains: &[S],
        cert_key_pem: Option<&[u8]>,
    ) -> Result<IssuedCertificate> {
        info!("renewing certificate");
        self.issue(domains, cert_key_pem)
    }

    /// 完成訂單內所有待驗證的授權。
    fn authorize(&self, order: &Order, poller: &Poller) -> Result<()> {
        let mut pending = Vec::new();
        for url in &order.authorizations {
            let authz = fetch_authorization(self.client, url)?;
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!(identifier = %authz.identifier, "authorization already valid");
                }
                AuthorizationStatus::Pending => pending.push(authz),
                _ => return Err(authz.failure()),
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let mut answers = Vec::with_capacity(pending.len());
        for authz in &pending {
            let challenge = select_challenge(authz, ChallengeType::Http01)?;
            let key_auth = compute_key_authorization(challenge, self.client.signer().key())?;
            answers.push((challenge, key_auth));
        }

        // 在輪詢結束前保留所有驗證內容；離開此函式時一併移除。
        let _published = answers
            .iter()
            .map(|(_, key_auth)| PublishedChallenge::publish(self.responder, key_auth))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (challenge, key_auth) in &answers {
            answer_challenge(self.client, challenge, key_auth)?;
        }

        self.poll_authorizations(&pending.iter().map(|a| a.url.as_str()).collect::<Vec<_>>(), poller)
    }

    /// 同時輪詢多個授權，第一個錯誤會取消其餘輪詢並被回傳。
    fn poll_authorizations(&self, urls: &[&str], poller: &Poller) -> Result<()> {
        let group = poller.child();
        let first_error: Mutex<Option<AcmeError>> = Mutex::new(None);

        thread::scope(|scope| {
            for &url in urls {
                let poller = group.child();
                let group = &group;
                let first_error = &first_error;
                scope.spawn(move || {
                    if let Err(e) = self.wait_authorization(url, &poller) {
                        let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            warn!(url, error = %e, "authorization failed, cancelling the rest");
                            *slot = Some(e);
                            group.cancel_token().cancel();
                        }
                    }
                });
            }
        });

        match first_error.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn wait_authorization(&self, url: &str, poller: &Poller) -> Result<()> {
        poller.poll_until("authorization", || {
            let authz = fetch_authorization(self.client, url)?;
            match authz.status {
                AuthorizationStatus::Pending => Ok(PollStep::Pending(authz.retry_after)),
                AuthorizationStatus::Valid => {
                    info!(identifier = %authz.identifier, "authorization valid");
                    Ok(PollStep::Done(()))
                }
                _ => Err(authz.failure()),
            }
        })
    }

    fn wait_ready(&self, order_url: &str, poller: &Poller) -> Result<Order> {
        poller.poll_until("order readiness", || {
            let order = fetch_order(self.client, order_url)?;
            match order.status {
                OrderStatus::Pending => Ok(PollStep::Pending(order.retry_after)),
                OrderStatus::Ready => Ok(PollStep::Done(order)),
                OrderStatus::Invalid => Err(order.failure()),
                status => Err(AcmeError::UnexpectedResponse(format!(
                    "order {} became {:?} before finalization",
                    order.url, status
                ))),
            }
        })
    }

    fn wait_valid(&self, finalized: Order, poller: &Poller) -> Result<Order> {
        match finalized.status {
            OrderStatus::Valid if finalized.certificate.is_some() => return Ok(finalized),
            OrderStatus::Invalid => return Err(finalized.failure()),
            _ => {}
        }

        poller.poll_until("certificate issuance", || {
            let order = fetch_order(self.client, &finalized.url)?;
            match order.status {
                OrderStatus::Valid => Ok(PollStep::Done(order)),
                OrderStatus::Invalid => Err(order.failure()),
                _ => Ok(PollStep::Pending(order.retry_after)),
            }
        })
    }
}

/// 撤銷憑證。以帳戶金鑰簽名，送出終端憑證與撤銷原因。
///
/// # 參數
///
/// - `client`: 已綁定簽發此憑證之帳戶的客戶端。
/// - `cert_pem`: 憑證或完整憑證鏈（只使用第一張）。
/// - `reason`: 撤銷原因。
pub fn revoke_certificate(
    client: &AcmeClient<'_>,
    cert_pem: &str,
    reason: RevocationReason,
) -> Result<()> {
    let leaf_der = Certificate::from_pem(cert_pem)?.leaf_der()?;
    let revoke_url = client.directory()?.revoke_cert.clone();
    client.post(
        &revoke_url,
        &RevocationPayload::new(&leaf_der, Some(reason.code())),
    )?;
    info!(reason = ?reason, "revoked certificate");
    Ok(())
}
