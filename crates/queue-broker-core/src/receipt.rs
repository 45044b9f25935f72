//! Receipt handle codec.
//!
//! A receipt handle binds one lease to one delivery of one message. Handles
//! are HMAC-SHA256 signed so the broker can reject forged or tampered handles
//! before touching any queue state:
//!
//! ```text
//! base64url(v1 \n <queue> \n <message_id> \n <nonce> \n <issued_at_ms>) "." base64url(tag)
//! ```
//!
//! The nonce makes every delivery's handle unique, so a handle from an
//! earlier lease never matches the current one.

use crate::config::ReceiptConfig;
use crate::error::{BrokerError, ConfigurationError};
use crate::message::{MessageId, QueueName, ReceiptHandle};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

#[cfg(test)]
#[path = "receipt_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

const FORMAT_VERSION: &str = "v1";

/// Claims carried inside a receipt handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptClaims {
    pub queue: QueueName,
    pub message_id: MessageId,
    pub nonce: String,
    pub issued_at_millis: i64,
}

/// Issues and opens signed receipt handles
#[derive(Clone)]
pub struct ReceiptCodec {
    mac: HmacSha256,
}

impl ReceiptCodec {
    /// Create a codec keyed with `secret`
    pub fn new(secret: &[u8]) -> Result<Self, ConfigurationError> {
        if secret.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "receipts.secret".to_string(),
            });
        }

        let mac = HmacSha256::new_from_slice(secret).map_err(|e| ConfigurationError::Invalid {
            message: format!("Failed to create HMAC instance: {}", e),
        })?;

        Ok(Self { mac })
    }

    /// Create a codec with a freshly generated key
    ///
    /// Handles issued by a random-keyed codec cannot be opened after a restart.
    pub fn random() -> Self {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());

        Self {
            mac: HmacSha256::new_from_slice(&key).expect("HMAC can take key of any size"),
        }
    }

    /// Build a codec from configuration
    pub fn from_config(config: &ReceiptConfig) -> Result<Self, ConfigurationError> {
        match &config.secret {
            Some(secret) => Self::new(secret.as_bytes()),
            None => Ok(Self::random()),
        }
    }

    /// Issue a new handle for a delivery of `message_id` from `queue`
    pub fn issue(&self, queue: &QueueName, message_id: &MessageId) -> ReceiptHandle {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let issued_at = chrono::Utc::now().timestamp_millis();

        let payload = format!(
            "{}\n{}\n{}\n{}\n{}",
            FORMAT_VERSION,
            queue.as_str(),
            message_id.as_str(),
            nonce,
            issued_at
        );
        let tag = self.sign(payload.as_bytes());

        ReceiptHandle::from_encoded(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Verify a handle's signature and extract its claims
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidReceipt` if the handle is malformed, was
    /// signed with another key, or has been altered.
    pub fn open(&self, handle: &ReceiptHandle) -> Result<ReceiptClaims, BrokerError> {
        let (encoded_payload, encoded_tag) = handle
            .as_str()
            .split_once('.')
            .ok_or_else(|| BrokerError::invalid_receipt("malformed receipt handle"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded_payload)
            .map_err(|_| BrokerError::invalid_receipt("malformed receipt handle"))?;
        let tag = URL_SAFE_NO_PAD
            .decode(encoded_tag)
            .map_err(|_| BrokerError::invalid_receipt("malformed receipt handle"))?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        // Constant-time tag comparison
        mac.verify_slice(&tag)
            .map_err(|_| BrokerError::invalid_receipt("receipt handle signature mismatch"))?;

        let payload = String::from_utf8(payload)
            .map_err(|_| BrokerError::invalid_receipt("receipt handle is not UTF-8"))?;

        Self::parse_claims(&payload)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    fn parse_claims(payload: &str) -> Result<ReceiptClaims, BrokerError> {
        let parts: Vec<&str> = payload.split('\n').collect();
        let [version, queue, message_id, nonce, issued_at] = parts.as_slice() else {
            return Err(BrokerError::invalid_receipt("unexpected receipt layout"));
        };

        if *version != FORMAT_VERSION {
            return Err(BrokerError::invalid_receipt(format!(
                "unsupported receipt version '{}'",
                version
            )));
        }

        let queue = QueueName::new(queue.to_string())
            .map_err(|e| BrokerError::invalid_receipt(e.to_string()))?;
        let message_id = message_id
            .parse::<MessageId>()
            .map_err(|e| BrokerError::invalid_receipt(e.to_string()))?;
        let issued_at_millis = issued_at
            .parse::<i64>()
            .map_err(|_| BrokerError::invalid_receipt("invalid issue time"))?;

        Ok(ReceiptClaims {
            queue,
            message_id,
            nonce: nonce.to_string(),
            issued_at_millis,
        })
    }
}

// Security: Don't expose key material in debug output
impl std::fmt::Debug for ReceiptCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptCodec")
            .field("key", &"<REDACTED>")
            .finish()
    }
}
