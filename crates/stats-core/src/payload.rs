//! Access to encrypted keystroke payloads.
//!
//! The recorder may store typed text and key names encrypted. Decryption is
//! supplied by the caller through [`PayloadDecryptor`]; this crate only
//! decides when a payload has to be opened and how its plaintext is read.

use thiserror::Error;

/// Errors raised while opening a keystroke payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The decryptor rejected the ciphertext (wrong key, corrupt data).
    #[error("failed to decrypt {field} of keystroke batch {row_id}")]
    Decrypt {
        row_id: i64,
        field: &'static str,
        #[source]
        source: DecryptError,
    },
    /// The decrypted text is not valid UTF-8.
    #[error("decrypted text of keystroke batch {row_id} is not valid UTF-8")]
    InvalidText {
        row_id: i64,
        #[source]
        source: std::string::FromUtf8Error,
    },
    /// The decrypted key list is not a JSON array of strings.
    #[error("decrypted keys of keystroke batch {row_id} are malformed")]
    InvalidKeys {
        row_id: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a [`PayloadDecryptor`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DecryptError {
    message: String,
}

impl DecryptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Turns stored ciphertext into plaintext bytes.
pub trait PayloadDecryptor {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError>;
}

/// Decryptor for stores that keep payloads unencrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl PayloadDecryptor for Plaintext {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        Ok(ciphertext.to_vec())
    }
}

impl<D: PayloadDecryptor + ?Sized> PayloadDecryptor for &D {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        (**self).decrypt(ciphertext)
    }
}

/// Decrypts the typed text of a batch. A missing payload reads as empty.
pub fn decrypt_text<D>(
    decryptor: &D,
    row_id: i64,
    payload: Option<&[u8]>,
) -> Result<String, PayloadError>
where
    D: PayloadDecryptor + ?Sized,
{
    let Some(payload) = payload else {
        return Ok(String::new());
    };
    let bytes = decryptor
        .decrypt(payload)
        .map_err(|source| PayloadError::Decrypt {
            row_id,
            field: "text",
            source,
        })?;
    String::from_utf8(bytes).map_err(|source| PayloadError::InvalidText { row_id, source })
}

/// Decrypts the pressed key names of a batch, in typing order.
///
/// The plaintext is a JSON array of strings. A missing payload reads as no
/// keys.
pub fn decrypt_keys<D>(
    decryptor: &D,
    row_id: i64,
    payload: Option<&[u8]>,
) -> Result<Vec<String>, PayloadError>
where
    D: PayloadDecryptor + ?Sized,
{
    let Some(payload) = payload else {
        return Ok(Vec::new());
    };
    let bytes = decryptor
        .decrypt(payload)
        .map_err(|source| PayloadError::Decrypt {
            row_id,
            field: "keys",
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| PayloadError::InvalidKeys { row_id, source })
}
