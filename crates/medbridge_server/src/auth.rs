//! Webhook signature verification.
//!
//! The portal signs every webhook delivery with HMAC-SHA256 over the raw
//! request body and sends the signature base64-encoded in the
//! `x-sync-signature` header. Verification runs before the body is parsed,
//! so a forged delivery never reaches the engine.

use crate::error::{ServerError, ServerResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Request header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "x-sync-signature";

/// Verifies webhook signatures against the shared portal secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<Vec<u8>>,
}

impl WebhookVerifier {
    /// Creates a verifier that requires a valid signature on every delivery.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret: Some(secret),
        }
    }

    /// Creates a verifier that accepts unsigned deliveries.
    ///
    /// Only for deployments where the portal cannot sign; requires the
    /// explicit `allow_unsigned_webhooks` configuration flag.
    pub fn unsigned() -> Self {
        Self { secret: None }
    }

    /// Signs a body the way the portal does.
    ///
    /// Returns `None` when the verifier runs unsigned.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
        mac.update(body);
        Some(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Verifies a signature over the raw request body.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> ServerResult<()> {
        let Some(secret) = self.secret.as_ref() else {
            return Ok(());
        };
        let Some(signature) = signature else {
            return Err(ServerError::Unauthorized(
                "missing webhook signature".into(),
            ));
        };
        let claimed = BASE64
            .decode(signature)
            .map_err(|_| ServerError::Unauthorized("signature is not valid base64".into()))?;

        let mut mac =
            HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
        mac.update(body);
        mac.verify_slice(&claimed)
            .map_err(|_| ServerError::Unauthorized("signature mismatch".into()))
    }
}
