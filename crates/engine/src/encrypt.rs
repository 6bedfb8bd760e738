//! Payload encryption for mailboxes and contacts with a registered key.
//!
//! The engine owns the PGP/MIME container format (RFC 3156); producing the
//! ASCII-armored ciphertext is delegated to the [`Encryptor`] trait so key
//! handling stays outside the relay.

use std::fmt::Display;

use uuid::Uuid;

use crate::{
    directory::PgpKey,
    message::EmailMessage,
};

/// Headers that describe the payload rather than the message; they move
/// into the encrypted inner part.
pub const MIME_HEADERS: [&str; 4] = [
    "MIME-Version",
    "Content-Type",
    "Content-Disposition",
    "Content-Transfer-Encoding",
];

/// Errors that can occur while encrypting a payload.
#[derive(Debug)]
pub enum EncryptError {
    /// The key was rejected or the backend failed. Treated as transient:
    /// the envelope is deferred, never delivered in clear.
    CannotEncrypt(String),
}

impl Display for EncryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptError::CannotEncrypt(msg) => write!(f, "Cannot encrypt payload: {msg}"),
        }
    }
}

impl std::error::Error for EncryptError {}

/// Produces ASCII-armored ciphertext for a recipient key.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &str, key: &PgpKey) -> Result<String, EncryptError>;
}

/// Rewraps `message` as a `multipart/encrypted` container, in place.
///
/// The inner part keeps the payload-describing MIME headers and the body;
/// every other header stays on the container, so routing headers remain
/// visible while content is opaque. The container gets a fresh random
/// boundary.
pub fn encrypt_message(
    message: &mut EmailMessage,
    key: &PgpKey,
    encryptor: &dyn Encryptor,
) -> Result<(), EncryptError> {
    let mut inner = String::new();
    for name in MIME_HEADERS {
        for value in message.all_headers(name) {
            inner.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    inner.push_str("\r\n");
    inner.push_str(message.body());

    let ciphertext = encryptor.encrypt(&inner, key)?;

    let boundary = format!("={}=", Uuid::new_v4());
    for name in MIME_HEADERS {
        message.remove_header(name);
    }
    message.append_header("MIME-Version", "1.0");
    message.append_header(
        "Content-Type",
        &format!(
            "multipart/encrypted; protocol=\"application/pgp-encrypted\"; boundary=\"{boundary}\""
        ),
    );

    let mut body = String::new();
    body.push_str(&format!("--{boundary}\r\n"));
    body.push_str("Content-Type: application/pgp-encrypted\r\n");
    body.push_str("Content-Description: PGP/MIME version identification\r\n\r\n");
    body.push_str("Version: 1\r\n\r\n");
    body.push_str(&format!("--{boundary}\r\n"));
    body.push_str("Content-Type: application/octet-stream; name=\"encrypted.asc\"\r\n");
    body.push_str("Content-Description: OpenPGP encrypted message\r\n");
    body.push_str("Content-Disposition: inline; filename=\"encrypted.asc\"\r\n\r\n");
    body.push_str(&ciphertext);
    if !ciphertext.ends_with("\r\n") {
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{boundary}--\r\n"));

    message.set_body(body);
    message.rebuild();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseEncryptor;

    impl Encryptor for UppercaseEncryptor {
        fn encrypt(&self, plaintext: &str, _key: &PgpKey) -> Result<String, EncryptError> {
            Ok(format!(
                "-----BEGIN PGP MESSAGE-----\r\n{}\r\n-----END PGP MESSAGE-----",
                plaintext.to_uppercase()
            ))
        }
    }

    struct FailingEncryptor;

    impl Encryptor for FailingEncryptor {
        fn encrypt(&self, _plaintext: &str, _key: &PgpKey) -> Result<String, EncryptError> {
            Err(EncryptError::CannotEncrypt("bad key".to_string()))
        }
    }

    fn test_key() -> PgpKey {
        PgpKey {
            fingerprint: "ABCD".to_string(),
            public_key: "-----BEGIN PGP PUBLIC KEY BLOCK-----".to_string(),
        }
    }

    fn plaintext_message() -> EmailMessage {
        EmailMessage::from_raw(
            "sender@corp.example",
            "me@real.example",
            "From: sender@corp.example\r\nSubject: quarterly numbers\r\nMIME-Version: 1.0\r\nContent-Type: text/plain\r\n\r\nconfidential body\r\n",
        )
    }

    #[test]
    fn test_encrypt_message_builds_container() {
        let mut message = plaintext_message();
        encrypt_message(&mut message, &test_key(), &UppercaseEncryptor).unwrap();

        let content_type = message.header("Content-Type").unwrap();
        assert!(content_type.starts_with("multipart/encrypted"));
        assert!(content_type.contains("application/pgp-encrypted"));

        assert!(message.body().contains("Version: 1"));
        assert!(message.body().contains("encrypted.asc"));
        assert!(message.raw().contains("multipart/encrypted"));
    }

    #[test]
    fn test_encrypt_message_hides_plaintext() {
        let mut message = plaintext_message();
        encrypt_message(&mut message, &test_key(), &UppercaseEncryptor).unwrap();

        assert!(!message.raw().contains("confidential body"));
        // the inner MIME headers moved into the ciphertext
        assert!(message.body().contains("CONTENT-TYPE: TEXT/PLAIN"));
        // routing headers stay visible on the container
        assert_eq!(message.header("Subject"), Some("quarterly numbers"));
    }

    #[test]
    fn test_encrypt_message_failure_leaves_error() {
        let mut message = plaintext_message();
        let err = encrypt_message(&mut message, &test_key(), &FailingEncryptor).unwrap_err();
        assert!(matches!(err, EncryptError::CannotEncrypt(_)));
    }
}
