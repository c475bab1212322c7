use crate::config::SecretString;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEX_LEN: usize = 64;

/// Checks gateway callback signatures: hex HMAC-SHA256 of
/// `<gateway_order_id>|<gateway_payment_id>` keyed by the gateway secret.
#[derive(Clone, Debug)]
pub struct SignatureVerifier {
    secret: SecretString,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self, order_id: &str, payment_id: &str) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.secret.expose().as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(order_id.as_bytes());
        mac.update(b"|");
        mac.update(payment_id.as_bytes());
        mac
    }

    /// Lower-case hex signature for the given identifiers.
    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        hex::encode(self.mac(order_id, payment_id).finalize().into_bytes())
    }

    /// Constant-time comparison against the presented signature, which must be
    /// the exact lower-case hex digest.
    pub fn verify(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        if self.secret.is_empty() || !is_canonical_hex(signature) {
            return false;
        }
        let Ok(presented) = hex::decode(signature) else {
            return false;
        };
        self.mac(order_id, payment_id)
            .verify_slice(&presented)
            .is_ok()
    }
}

fn is_canonical_hex(signature: &str) -> bool {
    signature.len() == SIGNATURE_HEX_LEN
        && signature
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
