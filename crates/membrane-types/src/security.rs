//! # Authenticity Verification
//!
//! Every envelope crossing the membrane is signed over its canonical bytes
//! (see [`Envelope::canonical_bytes`]). Keys are pre-loaded into a
//! [`KeyRing`] at startup; verification never touches the network.
//!
//! ## Verification Steps (in order)
//!
//! 1. **Presence**: unsigned envelopes are rejected
//! 2. **Suite**: the declared algorithm must be in the allow-list
//! 3. **Origin**: a key must be bound to the envelope's origin
//! 4. **Binding**: declared algorithm and key id must match the bound key
//! 5. **Signature**: recomputed over the canonical bytes, constant time
//!
//! Every step fails closed.

use crate::envelope::{Envelope, SignatureBlock};
use crate::errors::{AuthFailure, SigningError};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Origin the hub uses for envelopes it emits itself.
pub const HUB_ORIGIN: &str = "protocol.hub";

/// Key id of the hub's own signing key.
pub const HUB_KEY_ID: &str = "hub";

// =============================================================================
// SIGNATURE SUITES
// =============================================================================

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureSuite {
    HmacSha256,
    Ed25519,
}

impl SignatureSuite {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HmacSha256 => "hmac-sha256",
            Self::Ed25519 => "ed25519",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "hmac-sha256" => Some(Self::HmacSha256),
            "ed25519" => Some(Self::Ed25519),
            _ => None,
        }
    }
}

impl fmt::Display for SignatureSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// KEY RING
// =============================================================================

/// Verification key material.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Shared secret.
    Hmac(Vec<u8>),
    /// Public key.
    Ed25519(VerifyingKey),
}

impl KeyMaterial {
    #[must_use]
    pub fn suite(&self) -> SignatureSuite {
        match self {
            Self::Hmac(_) => SignatureSuite::HmacSha256,
            Self::Ed25519(_) => SignatureSuite::Ed25519,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hmac(_) => f.write_str("Hmac(<redacted>)"),
            Self::Ed25519(key) => write!(f, "Ed25519({})", hex::encode(key.as_bytes())),
        }
    }
}

/// A key bound to one origin.
#[derive(Debug, Clone)]
pub struct BoundKey {
    pub key_id: String,
    pub material: KeyMaterial,
}

/// Source of verification keys, by origin.
pub trait KeyProvider: Send + Sync {
    /// Returns the key bound to `origin`, or `None` if the origin is unknown.
    fn key_for(&self, origin: &str) -> Option<&BoundKey>;
}

/// Errors parsing a key ring description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyRingError {
    #[error("Malformed key entry `{0}`: expected origin=suite:key_id:hex")]
    MalformedEntry(String),

    #[error("Unknown signature suite `{0}`")]
    UnknownSuite(String),

    #[error("Key for origin {origin} is not valid hex")]
    InvalidHex { origin: String },

    #[error("Key for origin {origin} is not a valid {suite} key")]
    InvalidKey { origin: String, suite: String },
}

/// In-memory `origin -> key` table.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, BoundKey>,
}

impl KeyRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind (or rebind) a key to `origin`.
    pub fn insert(
        &mut self,
        origin: impl Into<String>,
        key_id: impl Into<String>,
        material: KeyMaterial,
    ) {
        self.keys.insert(
            origin.into(),
            BoundKey {
                key_id: key_id.into(),
                material,
            },
        );
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parse `origin=suite:key_id:hex;origin=suite:key_id:hex`.
    ///
    /// HMAC keys are the raw shared secret; ed25519 keys are the 32-byte
    /// public key.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyRingError`] for the first entry that does not parse.
    pub fn parse(text: &str) -> Result<Self, KeyRingError> {
        let mut ring = Self::new();
        for entry in text.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let malformed = || KeyRingError::MalformedEntry(entry.to_string());
            let (origin, rest) = entry.split_once('=').ok_or_else(malformed)?;
            let mut parts = rest.splitn(3, ':');
            let (Some(suite), Some(key_id), Some(key_hex)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(malformed());
            };
            let origin = origin.trim();
            if origin.is_empty() || key_id.trim().is_empty() {
                return Err(malformed());
            }

            let suite = SignatureSuite::parse(suite)
                .ok_or_else(|| KeyRingError::UnknownSuite(suite.trim().to_string()))?;
            let bytes = hex::decode(key_hex.trim()).map_err(|_| KeyRingError::InvalidHex {
                origin: origin.to_string(),
            })?;
            let invalid_key = || KeyRingError::InvalidKey {
                origin: origin.to_string(),
                suite: suite.to_string(),
            };

            let material = match suite {
                SignatureSuite::HmacSha256 if bytes.is_empty() => return Err(invalid_key()),
                SignatureSuite::HmacSha256 => KeyMaterial::Hmac(bytes),
                SignatureSuite::Ed25519 => {
                    let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| invalid_key())?;
                    KeyMaterial::Ed25519(
                        VerifyingKey::from_bytes(&raw).map_err(|_| invalid_key())?,
                    )
                }
            };
            ring.insert(origin, key_id.trim(), material);
        }
        Ok(ring)
    }
}

impl KeyProvider for KeyRing {
    fn key_for(&self, origin: &str) -> Option<&BoundKey> {
        self.keys.get(origin)
    }
}

// =============================================================================
// VERIFIER
// =============================================================================

/// Verifies envelope signatures against a [`KeyProvider`].
pub struct AuthenticityVerifier<K: KeyProvider> {
    allowed: Vec<SignatureSuite>,
    keys: K,
}

impl<K: KeyProvider> AuthenticityVerifier<K> {
    pub fn new(allowed: Vec<SignatureSuite>, keys: K) -> Self {
        Self { allowed, keys }
    }

    #[must_use]
    pub fn allowed_suites(&self) -> &[SignatureSuite] {
        &self.allowed
    }

    #[must_use]
    pub fn keys(&self) -> &K {
        &self.keys
    }

    /// Verify the envelope's detached signature.
    ///
    /// # Errors
    ///
    /// The first failing check, as an [`AuthFailure`].
    pub fn verify(&self, envelope: &Envelope) -> Result<(), AuthFailure> {
        let sig = envelope.signature().ok_or(AuthFailure::MissingSignature)?;

        let suite = SignatureSuite::parse(&sig.algorithm)
            .filter(|s| self.allowed.contains(s))
            .ok_or_else(|| AuthFailure::SuiteNotAllowed(sig.algorithm.clone()))?;

        let bound = self
            .keys
            .key_for(envelope.origin())
            .ok_or_else(|| AuthFailure::UnknownOrigin(envelope.origin().to_string()))?;

        if bound.material.suite() != suite {
            return Err(AuthFailure::SuiteMismatch {
                origin: envelope.origin().to_string(),
                declared: suite.to_string(),
                bound: bound.material.suite().to_string(),
            });
        }
        if bound.key_id != sig.key_id {
            return Err(AuthFailure::KeyMismatch {
                origin: envelope.origin().to_string(),
                declared: sig.key_id.clone(),
            });
        }

        let sig_bytes =
            hex::decode(&sig.value).map_err(|e| AuthFailure::MalformedSignature(e.to_string()))?;
        let message = envelope
            .canonical_bytes()
            .map_err(|e| AuthFailure::Canonicalization(e.to_string()))?;

        match &bound.material {
            KeyMaterial::Hmac(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret)
                    .map_err(|e| AuthFailure::MalformedSignature(e.to_string()))?;
                mac.update(&message);
                // Constant-time comparison
                mac.verify_slice(&sig_bytes)
                    .map_err(|_| AuthFailure::SignatureMismatch)
            }
            KeyMaterial::Ed25519(public) => {
                let signature = Signature::from_slice(&sig_bytes)
                    .map_err(|e| AuthFailure::MalformedSignature(e.to_string()))?;
                public
                    .verify_strict(&message, &signature)
                    .map_err(|_| AuthFailure::SignatureMismatch)
            }
        }
    }
}

// =============================================================================
// SIGNER
// =============================================================================

/// Signs envelopes over their canonical bytes.
#[derive(Clone)]
pub enum EnvelopeSigner {
    Hmac { key_id: String, secret: Vec<u8> },
    Ed25519 { key_id: String, key: SigningKey },
}

impl fmt::Debug for EnvelopeSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeSigner")
            .field("suite", &self.suite())
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

impl EnvelopeSigner {
    pub fn hmac(key_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self::Hmac {
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    pub fn ed25519(key_id: impl Into<String>, key: SigningKey) -> Self {
        Self::Ed25519 {
            key_id: key_id.into(),
            key,
        }
    }

    #[must_use]
    pub fn suite(&self) -> SignatureSuite {
        match self {
            Self::Hmac { .. } => SignatureSuite::HmacSha256,
            Self::Ed25519 { .. } => SignatureSuite::Ed25519,
        }
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        match self {
            Self::Hmac { key_id, .. } | Self::Ed25519 { key_id, .. } => key_id,
        }
    }

    /// Matching verification material, for registering this signer in a
    /// [`KeyRing`].
    #[must_use]
    pub fn verification_material(&self) -> KeyMaterial {
        match self {
            Self::Hmac { secret, .. } => KeyMaterial::Hmac(secret.clone()),
            Self::Ed25519 { key, .. } => KeyMaterial::Ed25519(key.verifying_key()),
        }
    }

    /// Consume an envelope and return it sealed with a fresh signature.
    ///
    /// # Errors
    ///
    /// [`SigningError`] if the envelope has no canonical form.
    pub fn sign(&self, envelope: Envelope) -> Result<Envelope, SigningError> {
        let message = envelope.canonical_bytes()?;
        let value = match self {
            Self::Hmac { secret, .. } => {
                let mut mac =
                    HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
                mac.update(&message);
                hex::encode(mac.finalize().into_bytes())
            }
            Self::Ed25519 { key, .. } => hex::encode(key.sign(&message).to_bytes()),
        };
        Ok(envelope.sealed(SignatureBlock {
            algorithm: self.suite().as_str().to_string(),
            key_id: self.key_id().to_string(),
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EnvelopeCodec;
    use crate::envelope::{Payload, WorkViewInvalidated};
    use chrono::Utc;
    use rand::rngs::OsRng;

    fn envelope(origin: &str) -> Envelope {
        Envelope::new(
            "ecosystem/mind/org/acme/docs.view.invalidated",
            origin,
            Utc::now(),
            Payload::WorkViewInvalidated(WorkViewInvalidated {
                reasons: vec!["graph.delta.node.upsert".into()],
                affects: vec!["architecture:/".into()],
            }),
        )
    }

    fn setup() -> (AuthenticityVerifier<KeyRing>, EnvelopeSigner, EnvelopeSigner) {
        let hmac = EnvelopeSigner::hmac("k-hmac", b"shared-secret".to_vec());
        let ed = EnvelopeSigner::ed25519("k-ed", SigningKey::generate(&mut OsRng));
        let mut ring = KeyRing::new();
        ring.insert("l2.graph", hmac.key_id(), hmac.verification_material());
        ring.insert("l3.docs", ed.key_id(), ed.verification_material());
        let verifier = AuthenticityVerifier::new(
            vec![SignatureSuite::HmacSha256, SignatureSuite::Ed25519],
            ring,
        );
        (verifier, hmac, ed)
    }

    #[test]
    fn test_valid_signatures_pass() {
        let (verifier, hmac, ed) = setup();
        assert!(verifier.verify(&hmac.sign(envelope("l2.graph")).unwrap()).is_ok());
        assert!(verifier.verify(&ed.sign(envelope("l3.docs")).unwrap()).is_ok());
    }

    #[test]
    fn test_missing_signature() {
        let (verifier, _, _) = setup();
        assert_eq!(
            verifier.verify(&envelope("l2.graph")),
            Err(AuthFailure::MissingSignature)
        );
    }

    #[test]
    fn test_suite_outside_allow_list_fails_closed() {
        let (_, hmac, _) = setup();
        let mut ring = KeyRing::new();
        ring.insert("l2.graph", hmac.key_id(), hmac.verification_material());
        let verifier = AuthenticityVerifier::new(vec![SignatureSuite::Ed25519], ring);

        assert_eq!(
            verifier.verify(&hmac.sign(envelope("l2.graph")).unwrap()),
            Err(AuthFailure::SuiteNotAllowed("hmac-sha256".into()))
        );
    }

    #[test]
    fn test_unknown_origin_and_key_binding() {
        let (verifier, hmac, ed) = setup();
        assert_eq!(
            verifier.verify(&hmac.sign(envelope("l9.rogue")).unwrap()),
            Err(AuthFailure::UnknownOrigin("l9.rogue".into()))
        );
        // ed25519 signature from an origin bound to an HMAC key
        assert!(matches!(
            verifier.verify(&ed.sign(envelope("l2.graph")).unwrap()),
            Err(AuthFailure::SuiteMismatch { .. })
        ));
        let wrong_id = EnvelopeSigner::hmac("k-other", b"shared-secret".to_vec());
        assert!(matches!(
            verifier.verify(&wrong_id.sign(envelope("l2.graph")).unwrap()),
            Err(AuthFailure::KeyMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let (verifier, hmac, _) = setup();
        let signed = hmac.sign(envelope("l2.graph")).unwrap();
        let forged = Envelope::new(
            "ecosystem/mind/org/evil/docs.view.invalidated",
            signed.origin(),
            signed.timestamp(),
            signed.payload().clone(),
        )
        .sealed(signed.signature().unwrap().clone());

        assert_eq!(verifier.verify(&forged), Err(AuthFailure::SignatureMismatch));
    }

    /// Sign `canonical` (already sorted, compact JSON) the way a publisher in
    /// another stack would, and frame it for the wire.
    fn externally_signed(canonical: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(b"shared-secret").unwrap();
        mac.update(canonical.as_bytes());
        let mut body: serde_json::Value = serde_json::from_str(canonical).unwrap();
        body["signature"] = serde_json::json!({
            "algorithm": "hmac-sha256",
            "key_id": "k-hmac",
            "value": hex::encode(mac.finalize().into_bytes()),
        });
        serde_json::to_vec(&body).unwrap()
    }

    #[test]
    fn test_signature_covers_the_body_as_received() {
        let (verifier, _, _) = setup();
        let codec = EnvelopeCodec::default();
        let bodies = [
            // Offset timestamp instead of `Z`.
            r#"{"channel":"ecosystem/mind/org/acme/docs.view.invalidated","origin":"l2.graph","payload":{"affects":["coverage:*"],"reasons":["graph.delta.node.upsert"]},"timestamp":"2025-11-04T14:00:00+00:00","type":"docs.view.invalidated"}"#,
            // Integer in a float field.
            r#"{"channel":"ecosystem/mind/org/acme/economy.debit","origin":"l2.graph","payload":{"actual_cost":5,"org":"acme","quote_id":"q-1","work_completed":true},"timestamp":"2025-11-04T14:00:00Z","type":"debit"}"#,
            // Legacy type alias.
            r#"{"channel":"failure.emit","origin":"l2.graph","payload":{"code_location":"l2:sync","exception":"boom","severity":"error","suggestion":"retry"},"timestamp":"2025-11-04T14:00:00Z","type":"failure.emit"}"#,
        ];

        for canonical in bodies {
            let envelope = codec.decode_envelope(&externally_signed(canonical)).unwrap();
            assert_eq!(verifier.verify(&envelope), Ok(()), "{canonical}");
            assert_eq!(envelope.canonical_bytes().unwrap(), canonical.as_bytes());

            // Forwarded frames carry the publisher's spelling.
            let forwarded: serde_json::Value =
                serde_json::from_slice(&crate::codec::encode(&envelope)).unwrap();
            let mut expected: serde_json::Value = serde_json::from_str(canonical).unwrap();
            expected["signature"] = forwarded["signature"].clone();
            assert_eq!(forwarded, expected);
        }
    }

    #[test]
    fn test_tampered_received_body_fails() {
        let (verifier, _, _) = setup();
        let canonical = r#"{"channel":"ecosystem/mind/org/acme/economy.debit","origin":"l2.graph","payload":{"actual_cost":5,"org":"acme","quote_id":"q-1","work_completed":true},"timestamp":"2025-11-04T14:00:00Z","type":"debit"}"#;
        let wire = String::from_utf8(externally_signed(canonical)).unwrap();
        let tampered = wire.replace(r#""actual_cost":5"#, r#""actual_cost":5.0"#);
        let envelope = EnvelopeCodec::default()
            .decode_envelope(tampered.as_bytes())
            .unwrap();
        assert_eq!(verifier.verify(&envelope), Err(AuthFailure::SignatureMismatch));
    }

    #[test]
    fn test_malformed_signature_value() {
        let (verifier, _, _) = setup();
        let env = envelope("l3.docs").sealed(SignatureBlock {
            algorithm: "ed25519".into(),
            key_id: "k-ed".into(),
            value: "zz".into(),
        });
        assert!(matches!(
            verifier.verify(&env),
            Err(AuthFailure::MalformedSignature(_))
        ));

        let short = envelope("l3.docs").sealed(SignatureBlock {
            algorithm: "ed25519".into(),
            key_id: "k-ed".into(),
            value: "abcd".into(),
        });
        assert!(matches!(
            verifier.verify(&short),
            Err(AuthFailure::MalformedSignature(_))
        ));
    }

    #[test]
    fn test_key_ring_parse() {
        let public = SigningKey::generate(&mut OsRng).verifying_key();
        let text = format!(
            "l2.graph=hmac-sha256:k1:736563726574; l3.docs=ed25519:k2:{}",
            hex::encode(public.as_bytes())
        );
        let ring = KeyRing::parse(&text).unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.key_for("l3.docs").unwrap().key_id, "k2");
        assert_eq!(
            ring.key_for("l2.graph").unwrap().material.suite(),
            SignatureSuite::HmacSha256
        );
    }

    #[test]
    fn test_key_ring_parse_errors() {
        assert!(KeyRing::parse("").unwrap().is_empty());
        assert!(matches!(
            KeyRing::parse("no-equals"),
            Err(KeyRingError::MalformedEntry(_))
        ));
        assert!(matches!(
            KeyRing::parse("a=rsa:k:00"),
            Err(KeyRingError::UnknownSuite(_))
        ));
        assert!(matches!(
            KeyRing::parse("a=hmac-sha256:k:xyz"),
            Err(KeyRingError::InvalidHex { .. })
        ));
        assert!(matches!(
            KeyRing::parse("a=ed25519:k:00ff"),
            Err(KeyRingError::InvalidKey { .. })
        ));
    }
}
