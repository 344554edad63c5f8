pub mod audit;
pub mod crypto;
pub mod db;
pub mod model;

pub use audit::{AuditEntry, AuditLog, AuditResult, ChainStatus};
pub use db::CredentialStore;
pub use model::{Credential, CredentialMeta, SecretPayload, Selectors, ServiceType};
