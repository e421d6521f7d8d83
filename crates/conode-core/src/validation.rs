//! Envelope checks that need no storage.

use chrono::{DateTime, Duration, Utc};

use crate::cdid::TypedId;
use crate::crypto::{is_ccid, is_ckid, verify, Signature};
use crate::document::Document;
use crate::error::CoreError;

/// Tolerated clock skew for a `signedAt` in the future.
pub const DEFAULT_SIGNED_AT_SKEW: Duration = Duration::seconds(30);

/// Structural checks on a decoded document.
///
/// - `signer` must be an entity address
/// - `keyID`, when present, must be a subkey address
/// - `signedAt` may not lie more than `skew` beyond `now`
/// - `policyParams`, when present, must be a JSON object
/// - an explicit record `id` must be a resource id
pub fn validate_envelope(
    doc: &Document,
    now: DateTime<Utc>,
    skew: Duration,
) -> Result<(), CoreError> {
    let base = doc.base();

    if !is_ccid(&base.signer) {
        return Err(CoreError::Malformed(format!(
            "signer: `{}` is not an entity address",
            base.signer
        )));
    }

    if let Some(key_id) = base.key_id.as_deref() {
        if !key_id.is_empty() && !is_ckid(key_id) {
            return Err(CoreError::Malformed(format!(
                "keyID: `{}` is not a subkey address",
                key_id
            )));
        }
    }

    if base.signed_at > now + skew {
        return Err(CoreError::FutureSignedAt(base.signed_at.to_rfc3339()));
    }

    doc.policy_params()?;

    if let Some(id) = doc.explicit_id().filter(|id| !id.is_empty()) {
        TypedId::parse(id)?;
    }

    Ok(())
}

/// Verify the signature (hex) over the raw document bytes against `address`.
pub fn verify_document(raw: &str, signature: &str, address: &str) -> Result<(), CoreError> {
    let sig = Signature::from_hex(signature)?;
    verify(raw.as_bytes(), &sig, address)
}
