//! # acmeflow
//!
//! 以 ACME 協議（RFC 8555）向 Let's Encrypt 等 CA 申請、續期與撤銷 TLS 憑證，
//! 使用 HTTP-01 驗證。
//!
//! ## 模組
//!
//! - **帳戶**：[`account`] 管理帳戶金鑰與 CA 上的帳戶資源，只註冊一次。
//! - **通訊**：[`client`] 負責目錄、nonce 與 JWS 簽名，所有請求都經過 [`transport::HttpTransport`]。
//! - **簽發**：[`workflow`] 串起訂單、挑戰、最終確認與下載；驗證內容由
//!   [`responder::ChallengeResponder`] 發布，並在流程結束時移除。
//! - **輪詢**：[`poll`] 提供共用期限與取消訊號，CA 的 `Retry-After` 會被遵守。
//!
//! ## 示例
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use acmeflow::{
//!     account::{AccountManager, Identity},
//!     client::AcmeClient,
//!     config::AcmeConfig,
//!     responder::FileResponder,
//!     storage::{FileStorage, Storage},
//!     workflow::OrderWorkflow,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AcmeConfig::lets_encrypt_staging(&["admin@example.com"]);
//!     let storage = FileStorage::open(&config.storage_path)?;
//!
//!     // 1. 讀取或建立帳戶金鑰，並確保帳戶存在
//!     let identity = Identity::load_or_create(&storage, &config)?;
//!     let client = AcmeClient::new(
//!         Arc::new(config.http_transport()?),
//!         &config.directory_url,
//!         identity.key(),
//!     );
//!     AccountManager::new(&storage, &config.account_path).ensure_account(&client, &config.contact)?;
//!
//!     // 2. 將驗證內容寫入網站根目錄並簽發憑證
//!     let responder = FileResponder::new("/var/www/html");
//!     let issued = OrderWorkflow::from_config(&client, &responder, &config)
//!         .issue(&["example.com", "www.example.com"], None)?;
//!
//!     storage.write_file("certs/example.com/fullchain.pem", issued.fullchain_pem.as_bytes())?;
//!     storage.write_file("certs/example.com/privkey.pem", issued.private_key_pem.as_bytes())?;
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod authorization;
pub mod certificate;
pub mod challenge;
pub mod client;
pub mod config;
pub mod csr;
pub mod directory;
pub mod error;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod nonce;
pub mod order;
pub mod payload;
pub mod poll;
pub mod protection;
pub mod responder;
pub mod signature;
pub mod storage;
pub mod transport;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AcmeError, Problem, Result};
pub use workflow::{revoke_certificate, IssuedCertificate, OrderWorkflow, RevocationReason};
