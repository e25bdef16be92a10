// src/security/mod.rs
pub mod encryption;
pub mod validator;

pub use encryption::{EncryptedKey, KeyVault, SecretKeyMaterial};
pub use validator::{
    RiskFlag, RiskLevel, SecurityValidator, ValidationInput, ValidationReport,
};
