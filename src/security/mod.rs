pub mod crypto;
pub mod redaction;

pub use crypto::{decrypt_payload, encrypt_payload, encryption_enabled};
pub use redaction::redact_payload;
