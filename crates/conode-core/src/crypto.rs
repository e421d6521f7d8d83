//! Cryptographic primitives.
//!
//! Keccak-256 hashing, recoverable secp256k1 signatures and Bech32 addresses.

use std::fmt;

use bech32::{Bech32, Hrp};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

use crate::error::CoreError;

/// HRP of an entity address (CCID).
pub const ENTITY_HRP: &str = "con";

/// HRP of a delegated subkey address (CKID).
pub const SUBKEY_HRP: &str = "cck";

/// Length of an address string for either HRP.
pub const ADDRESS_LEN: usize = 42;

/// Legacy Keccak-256 (the pre-NIST padding).
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// A 65-byte recoverable signature `r || s || v`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 65]);

impl Signature {
    pub const fn from_bytes(bytes: [u8; 65]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 65] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| CoreError::InvalidSignature)?;
        let arr: [u8; 65] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::InvalidSignature)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A secp256k1 signing key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Load a private key from 32 raw bytes.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, CoreError> {
        let signing_key = SigningKey::from_slice(seed)
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Load a private key from hex.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::InvalidKey("private key must be 32 bytes".into()))?;
        Self::from_seed(&seed)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Address of this key under the given HRP.
    pub fn address(&self, hrp: &str) -> Result<String, CoreError> {
        address_from_public_key(self.verifying_key(), hrp)
    }

    /// Entity address (`con1…`).
    pub fn ccid(&self) -> String {
        // The HRP is a constant known to be valid.
        address_from_public_key(self.verifying_key(), ENTITY_HRP).unwrap_or_default()
    }

    /// Subkey address (`cck1…`).
    pub fn ckid(&self) -> String {
        address_from_public_key(self.verifying_key(), SUBKEY_HRP).unwrap_or_default()
    }

    /// Sign `keccak256(message)`.
    pub fn sign(&self, message: &[u8]) -> Result<Signature, CoreError> {
        let digest = keccak256(message);
        let (sig, recid) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| CoreError::InvalidKey(e.to_string()))?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        Ok(Signature(out))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.ccid())
    }
}

/// Derive `bech32(hrp, ripemd160(sha256(compressed_pubkey)))`.
pub fn address_from_public_key(key: &VerifyingKey, hrp: &str) -> Result<String, CoreError> {
    let point = key.to_encoded_point(true);
    let sha = Sha256::digest(point.as_bytes());
    let hash = Ripemd160::digest(sha);

    let hrp = Hrp::parse(hrp).map_err(|e| CoreError::InvalidAddress(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, &hash).map_err(|e| CoreError::InvalidAddress(e.to_string()))
}

/// Recover the signer's address under `hrp` from a signature over
/// `keccak256(message)`.
pub fn recover_address(
    message: &[u8],
    signature: &Signature,
    hrp: &str,
) -> Result<String, CoreError> {
    let digest = keccak256(message);
    let bytes = signature.as_bytes();

    let mut sig =
        EcdsaSignature::from_slice(&bytes[..64]).map_err(|_| CoreError::InvalidSignature)?;
    let v = match bytes[64] {
        v @ 27..=30 => v - 27,
        v => v,
    };
    let mut recid = RecoveryId::from_byte(v).ok_or(CoreError::InvalidSignature)?;

    // High-s signatures recover the same key once normalised with a flipped parity.
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        recid = RecoveryId::new(!recid.is_y_odd(), recid.is_x_reduced());
    }

    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recid)
        .map_err(|_| CoreError::InvalidSignature)?;
    address_from_public_key(&key, hrp)
}

/// Verify that `signature` over `message` was produced by `address`.
///
/// The HRP used for the comparison is taken from the address itself, so the
/// same key verifies against both its `con1` and `cck1` forms.
pub fn verify(message: &[u8], signature: &Signature, address: &str) -> Result<(), CoreError> {
    let hrp = address
        .get(..3)
        .ok_or_else(|| CoreError::InvalidAddress(address.to_string()))?;
    let recovered = recover_address(message, signature, hrp)?;
    if recovered != address {
        return Err(CoreError::InvalidSignature);
    }
    Ok(())
}

fn has_hrp(address: &str, expected: &str) -> bool {
    if address.len() != ADDRESS_LEN {
        return false;
    }
    match bech32::decode(address) {
        Ok((hrp, data)) => hrp.to_lowercase() == expected && data.len() == 20,
        Err(_) => false,
    }
}

/// Whether `address` is a well-formed entity address.
pub fn is_ccid(address: &str) -> bool {
    has_hrp(address, ENTITY_HRP)
}

/// Whether `address` is a well-formed subkey address.
pub fn is_ckid(address: &str) -> bool {
    has_hrp(address, SUBKEY_HRP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_vector() {
        // Keccak-256 of the empty string, not SHA3-256.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_address_shape() {
        let kp = Keypair::generate();
        let ccid = kp.ccid();
        let ckid = kp.ckid();
        assert!(ccid.starts_with("con1"));
        assert!(ckid.starts_with("cck1"));
        assert_eq!(ccid.len(), ADDRESS_LEN);
        assert_eq!(ckid.len(), ADDRESS_LEN);
        assert!(is_ccid(&ccid));
        assert!(!is_ccid(&ckid));
        assert!(is_ckid(&ckid));
        assert!(!is_ckid("cck1notanaddress"));
    }

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello").unwrap();
        verify(b"hello", &sig, &kp.ccid()).unwrap();
        verify(b"hello", &sig, &kp.ckid()).unwrap();
        assert!(matches!(
            verify(b"hullo", &sig, &kp.ccid()),
            Err(CoreError::InvalidSignature)
        ));
        assert!(verify(b"hello", &sig, &Keypair::generate().ccid()).is_err());
    }

    #[test]
    fn test_legacy_recovery_byte_accepted() {
        let kp = Keypair::generate();
        let mut sig = kp.sign(b"payload").unwrap();
        sig.0[64] += 27;
        verify(b"payload", &sig, &kp.ccid()).unwrap();
    }

    #[test]
    fn test_signature_hex() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"x").unwrap();
        let parsed = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(parsed, sig);
        assert!(Signature::from_hex("abcd").is_err());
        assert!(Signature::from_hex("zz").is_err());
    }

    #[test]
    fn test_keypair_hex_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_hex(&kp.to_hex()).unwrap();
        assert_eq!(restored.ccid(), kp.ccid());
        assert!(Keypair::from_hex("00").is_err());
    }
}
