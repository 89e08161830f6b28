mod cipher;

pub use cipher::{CredentialVault, EncryptedPayload, VaultError};
