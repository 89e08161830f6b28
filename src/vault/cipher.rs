use aes_gcm::{
    aead::{
        generic_array::{typenum::U16, GenericArray},
        Aead, KeyInit, Payload,
    },
    aes::Aes256,
    AesGcm,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::warn;

use crate::config::VaultConfig;

/// AES-256-GCM with a 16-byte nonce, matching the stored record format.
type CredentialCipher = AesGcm<Aes256, U16>;

/// IV length in bytes (hex-encoded to 32 chars in storage).
pub const IV_LENGTH: usize = 16;
/// GCM authentication tag length in bytes, one tag per field.
pub const TAG_LENGTH: usize = 16;
/// Master key length for AES-256.
pub const KEY_LENGTH: usize = 32;

/// Separates the username tag from the password tag in the stored `auth_tag`.
const TAG_DELIMITER: char = ':';

const AAD_USERNAME: &[u8] = b"username";
const AAD_PASSWORD: &[u8] = b"password";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Authentication tag verification failed for at least one field.
    #[error("credential payload failed authentication")]
    TamperedOrCorrupted,
    /// The stored record is structurally invalid and was never a valid ciphertext.
    #[error("stored credential record is malformed: {0}")]
    MalformedInput(&'static str),
    #[error("encryption key is not {KEY_LENGTH} bytes")]
    InvalidKey,
}

/// Encrypted form of a credential pair, as persisted.
///
/// Both fields share one IV but carry distinct associated data, so a
/// username ciphertext can never be replayed in the password slot. The two
/// detached tags are stored joined by `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub encrypted_username: String,
    pub encrypted_password: String,
    pub auth_tag: String,
    pub iv: String,
}

struct ParsedPayload {
    username_ct: Vec<u8>,
    password_ct: Vec<u8>,
    username_tag: Vec<u8>,
    password_tag: Vec<u8>,
    iv: [u8; IV_LENGTH],
}

/// Reversible, tamper-evident storage of a (username, password) pair.
///
/// Stateless modulo the externally supplied master key; safe to call
/// concurrently.
#[derive(Clone)]
pub struct CredentialVault {
    key: [u8; KEY_LENGTH],
}

impl CredentialVault {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    pub fn from_hex_key(key_hex: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(key_hex).map_err(|_| VaultError::InvalidKey)?;
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| VaultError::InvalidKey)?;
        Ok(Self::new(key))
    }

    /// Builds the vault from configuration. Without a configured key an
    /// ephemeral one is generated, which makes stored credentials
    /// unreadable after restart; the config loader already refuses this in
    /// production.
    pub fn from_config(config: &VaultConfig) -> Result<Self, VaultError> {
        match &config.key_hex {
            Some(key_hex) => Self::from_hex_key(key_hex),
            None => {
                warn!("CREDENTIAL_ENCRYPTION_KEY not set; using an ephemeral key, stored credentials will not survive a restart");
                let mut key = [0u8; KEY_LENGTH];
                OsRng.fill_bytes(&mut key);
                Ok(Self::new(key))
            }
        }
    }

    fn cipher(&self) -> CredentialCipher {
        CredentialCipher::new(GenericArray::from_slice(&self.key))
    }

    /// Encrypts a credential pair under a fresh random IV.
    ///
    /// Two calls with identical plaintext yield different ciphertext.
    pub fn encrypt(&self, username: &str, password: &str) -> Result<EncryptedPayload, VaultError> {
        let mut iv = [0u8; IV_LENGTH];
        OsRng.fill_bytes(&mut iv);
        let nonce = GenericArray::from_slice(&iv);
        let cipher = self.cipher();

        let mut username_ct = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: username.as_bytes(),
                    aad: AAD_USERNAME,
                },
            )
            .map_err(|_| VaultError::TamperedOrCorrupted)?;
        let mut password_ct = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: password.as_bytes(),
                    aad: AAD_PASSWORD,
                },
            )
            .map_err(|_| VaultError::TamperedOrCorrupted)?;

        let username_tag = username_ct.split_off(username_ct.len() - TAG_LENGTH);
        let password_tag = password_ct.split_off(password_ct.len() - TAG_LENGTH);

        Ok(EncryptedPayload {
            encrypted_username: hex::encode(username_ct),
            encrypted_password: hex::encode(password_ct),
            auth_tag: format!(
                "{}{}{}",
                hex::encode(username_tag),
                TAG_DELIMITER,
                hex::encode(password_tag)
            ),
            iv: hex::encode(iv),
        })
    }

    /// Decrypts and verifies both fields. Either both plaintexts come back
    /// or the call fails; there is no partial success.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<(String, String), VaultError> {
        let parsed = parse_payload(payload)?;
        let nonce = GenericArray::from_slice(&parsed.iv);
        let cipher = self.cipher();

        let username = decrypt_field(
            &cipher,
            nonce,
            &parsed.username_ct,
            &parsed.username_tag,
            AAD_USERNAME,
        )?;
        let password = decrypt_field(
            &cipher,
            nonce,
            &parsed.password_ct,
            &parsed.password_tag,
            AAD_PASSWORD,
        )?;

        Ok((username, password))
    }

    /// Pure structural check: distinguishes "never encrypted" from
    /// "corrupted ciphertext" before any decryption is attempted.
    pub fn validate_structure(payload: &EncryptedPayload) -> bool {
        parse_payload(payload).is_ok()
    }
}

fn decrypt_field(
    cipher: &CredentialCipher,
    nonce: &GenericArray<u8, U16>,
    ciphertext: &[u8],
    tag: &[u8],
    aad: &'static [u8],
) -> Result<String, VaultError> {
    let mut combined = Vec::with_capacity(ciphertext.len() + tag.len());
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| VaultError::TamperedOrCorrupted)?;

    String::from_utf8(plaintext).map_err(|_| VaultError::TamperedOrCorrupted)
}

fn parse_payload(payload: &EncryptedPayload) -> Result<ParsedPayload, VaultError> {
    let iv_bytes =
        hex::decode(&payload.iv).map_err(|_| VaultError::MalformedInput("iv is not hex"))?;
    let iv: [u8; IV_LENGTH] = iv_bytes
        .try_into()
        .map_err(|_| VaultError::MalformedInput("iv has wrong length"))?;

    let (username_tag_hex, password_tag_hex) = payload
        .auth_tag
        .split_once(TAG_DELIMITER)
        .ok_or(VaultError::MalformedInput("auth tag delimiter missing"))?;
    let username_tag = hex::decode(username_tag_hex)
        .map_err(|_| VaultError::MalformedInput("username tag is not hex"))?;
    let password_tag = hex::decode(password_tag_hex)
        .map_err(|_| VaultError::MalformedInput("password tag is not hex"))?;
    if username_tag.len() != TAG_LENGTH || password_tag.len() != TAG_LENGTH {
        return Err(VaultError::MalformedInput("auth tag has wrong length"));
    }

    let username_ct = hex::decode(&payload.encrypted_username)
        .map_err(|_| VaultError::MalformedInput("username ciphertext is not hex"))?;
    let password_ct = hex::decode(&payload.encrypted_password)
        .map_err(|_| VaultError::MalformedInput("password ciphertext is not hex"))?;

    Ok(ParsedPayload {
        username_ct,
        password_ct,
        username_tag,
        password_tag,
        iv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> CredentialVault {
        CredentialVault::new([7u8; KEY_LENGTH])
    }

    fn flip_first_byte(hex_str: &str) -> String {
        let mut bytes = hex::decode(hex_str).expect("valid hex");
        bytes[0] ^= 0x01;
        hex::encode(bytes)
    }

    #[test]
    fn round_trip() {
        let vault = test_vault();
        let payload = vault.encrypt("alice", "p@ss1").expect("encrypt");
        let (username, password) = vault.decrypt(&payload).expect("decrypt");
        assert_eq!(username, "alice");
        assert_eq!(password, "p@ss1");
    }

    #[test]
    fn encrypting_twice_yields_distinct_ciphertexts() {
        let vault = test_vault();
        let first = vault.encrypt("alice", "p@ss1").expect("encrypt");
        let second = vault.encrypt("alice", "p@ss1").expect("encrypt");

        assert_ne!(first.iv, second.iv);
        assert_ne!(first.encrypted_username, second.encrypted_username);
        assert_ne!(first.encrypted_password, second.encrypted_password);

        // Both still decrypt to the same plaintext.
        assert_eq!(vault.decrypt(&first).expect("first"), vault.decrypt(&second).expect("second"));
    }

    #[test]
    fn tampered_password_ciphertext_is_rejected() {
        let vault = test_vault();
        let mut payload = vault.encrypt("alice", "p@ss1").expect("encrypt");
        payload.encrypted_password = flip_first_byte(&payload.encrypted_password);
        assert_eq!(vault.decrypt(&payload), Err(VaultError::TamperedOrCorrupted));
    }

    #[test]
    fn tampered_auth_tag_is_rejected() {
        let vault = test_vault();
        let mut payload = vault.encrypt("alice", "p@ss1").expect("encrypt");
        let (user_tag, pass_tag) = payload.auth_tag.split_once(':').expect("delimiter");
        payload.auth_tag = format!("{}:{}", flip_first_byte(user_tag), pass_tag);
        assert_eq!(vault.decrypt(&payload), Err(VaultError::TamperedOrCorrupted));
    }

    #[test]
    fn tampered_iv_is_rejected() {
        let vault = test_vault();
        let mut payload = vault.encrypt("alice", "p@ss1").expect("encrypt");
        payload.iv = flip_first_byte(&payload.iv);
        assert_eq!(vault.decrypt(&payload), Err(VaultError::TamperedOrCorrupted));
    }

    #[test]
    fn swapped_fields_are_rejected_by_domain_separation() {
        let vault = test_vault();
        let payload = vault.encrypt("alice", "p@ss1").expect("encrypt");
        let (user_tag, pass_tag) = payload.auth_tag.split_once(':').expect("delimiter");

        // Swap ciphertexts and tags wholesale: each field still carries a
        // valid GCM tag, but under the wrong associated data.
        let swapped = EncryptedPayload {
            encrypted_username: payload.encrypted_password.clone(),
            encrypted_password: payload.encrypted_username.clone(),
            auth_tag: format!("{}:{}", pass_tag, user_tag),
            iv: payload.iv.clone(),
        };
        assert_eq!(vault.decrypt(&swapped), Err(VaultError::TamperedOrCorrupted));
    }

    #[test]
    fn malformed_inputs_are_distinguished_from_tampering() {
        let vault = test_vault();
        let good = vault.encrypt("alice", "p@ss1").expect("encrypt");

        let mut no_delim = good.clone();
        no_delim.auth_tag = no_delim.auth_tag.replace(':', "");
        assert!(matches!(vault.decrypt(&no_delim), Err(VaultError::MalformedInput(_))));

        let mut short_iv = good.clone();
        short_iv.iv.truncate(8);
        assert!(matches!(vault.decrypt(&short_iv), Err(VaultError::MalformedInput(_))));

        let mut not_hex = good;
        not_hex.encrypted_username = "zz-not-hex".into();
        assert!(matches!(vault.decrypt(&not_hex), Err(VaultError::MalformedInput(_))));
    }

    #[test]
    fn validate_structure_matches_parse_outcome() {
        let vault = test_vault();
        let good = vault.encrypt("alice", "p@ss1").expect("encrypt");
        assert!(CredentialVault::validate_structure(&good));

        let mut bad = good.clone();
        bad.iv = "deadbeef".into();
        assert!(!CredentialVault::validate_structure(&bad));

        // Tampering keeps the structure valid; only decryption catches it.
        let mut tampered = good;
        tampered.encrypted_password = flip_first_byte(&tampered.encrypted_password);
        assert!(CredentialVault::validate_structure(&tampered));
    }

    #[test]
    fn empty_credentials_round_trip() {
        let vault = test_vault();
        let payload = vault.encrypt("", "").expect("encrypt");
        assert_eq!(vault.decrypt(&payload).expect("decrypt"), (String::new(), String::new()));
    }

    #[test]
    fn hex_key_constructor_rejects_bad_keys() {
        assert!(CredentialVault::from_hex_key(&"ab".repeat(KEY_LENGTH)).is_ok());
        assert!(matches!(CredentialVault::from_hex_key("abcd"), Err(VaultError::InvalidKey)));
        assert!(matches!(CredentialVault::from_hex_key("not hex at all"), Err(VaultError::InvalidKey)));
    }
}
