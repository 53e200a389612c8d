//! Reality key material.
//!
//! The reality security mode runs an x25519 exchange; keys are 32 bytes and
//! travel as unpadded URL-safe base64, the encoding the tunnel engine prints
//! and parses. Short ids are up to 8 bytes of hex.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{CredentialError, Result};

/// Key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

/// Maximum short id length in bytes.
pub const SHORT_ID_MAX_BYTES: usize = 8;

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(s.trim())
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
    if bytes.len() != KEY_SIZE {
        return Err(CredentialError::InvalidKeyLength(bytes.len()));
    }
    let mut arr = [0u8; KEY_SIZE];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// A reality public key, handed to Relays.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key the way the tunnel engine expects it.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Decodes an engine-encoded public key.
    pub fn decode(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode();
        let short = &encoded[..8.min(encoded.len())];
        write!(f, "PublicKey({short}...)")
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A reality private key. Only ever present on the Entry node.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Generates a new random private key.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self(secret.to_bytes())
    }

    /// Creates a private key from a 32-byte array.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(*X25519PublicKey::from(&secret).as_bytes())
    }

    /// Encodes the key the way the tunnel engine expects it.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Decodes an engine-encoded private key.
    pub fn decode(s: &str) -> Result<Self> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A reality key pair (private + public).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::generate())
    }

    /// Creates a key pair from an existing private key.
    #[must_use]
    pub fn from_private_key(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Returns a reference to the private key.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Returns a reference to the public key.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

/// Reality short id: an even-length hex string of at most 16 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShortId(String);

impl ShortId {
    /// Generates a random full-length short id.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; SHORT_ID_MAX_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// The hex text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ShortId {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s.len() > SHORT_ID_MAX_BYTES * 2 {
            return Err(CredentialError::InvalidShortId(format!(
                "{s}: longer than {} hex characters",
                SHORT_ID_MAX_BYTES * 2
            )));
        }
        hex::decode(&s).map_err(|e| CredentialError::InvalidShortId(format!("{s}: {e}")))?;
        Ok(Self(s))
    }
}

impl TryFrom<String> for ShortId {
    type Error = CredentialError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ShortId> for String {
    fn from(value: ShortId) -> Self {
        value.0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// TLS client fingerprint the Relay presents while mimicking a browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fingerprint {
    /// Google Chrome.
    #[default]
    Chrome,
    /// Mozilla Firefox.
    Firefox,
    /// Apple Safari.
    Safari,
    /// iOS system stack.
    Ios,
    /// Android system stack.
    Android,
    /// Microsoft Edge.
    Edge,
    /// One browser profile chosen at random per process.
    Random,
    /// Fully randomised profile.
    Randomized,
}

impl Fingerprint {
    /// The engine's name for this fingerprint.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
            Self::Safari => "safari",
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Edge => "edge",
            Self::Random => "random",
            Self::Randomized => "randomized",
        }
    }
}

impl FromStr for Fingerprint {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chrome" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            "safari" => Ok(Self::Safari),
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "edge" => Ok(Self::Edge),
            "random" => Ok(Self::Random),
            "randomized" => Ok(Self::Randomized),
            other => Err(CredentialError::InvalidField(format!(
                "unknown fingerprint '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn private_key_to_public_key_is_deterministic() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn different_private_keys_produce_different_public_keys() {
        assert_ne!(
            PrivateKey::generate().public_key(),
            PrivateKey::generate().public_key()
        );
    }

    #[test]
    fn engine_encoding_is_unpadded_url_safe() {
        let public = PublicKey::from_bytes_array([0xfb; KEY_SIZE]);
        let encoded = public.encode();
        assert_eq!(encoded.len(), 43);
        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(PublicKey::decode(&encoded).expect("decode"), public);
    }

    #[test]
    fn private_key_debug_redacts() {
        let debug = format!("{:?}", KeyPair::generate());
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn keypair_serde_keeps_public_half_consistent() {
        let pair = KeyPair::generate();
        let json = serde_json::to_string(&pair).expect("serialize");
        let back: KeyPair = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, pair);
        assert_eq!(back.private_key().public_key(), *back.public_key());
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(matches!(
            PublicKey::decode(&short),
            Err(CredentialError::InvalidKeyLength(16))
        ));
    }

    #[test]
    fn generated_short_id_is_full_length_hex() {
        let id = ShortId::generate();
        assert_eq!(id.as_str().len(), SHORT_ID_MAX_BYTES * 2);
        assert!(id.as_str().parse::<ShortId>().is_ok());
    }

    #[test_case("" ; "empty short id is allowed")]
    #[test_case("0123" ; "two bytes")]
    #[test_case("0123456789abcdef" ; "eight bytes")]
    fn short_id_accepts(input: &str) {
        assert!(input.parse::<ShortId>().is_ok());
    }

    #[test_case("abc" ; "odd length")]
    #[test_case("zz" ; "not hex")]
    #[test_case("0123456789abcdef00" ; "too long")]
    fn short_id_rejects(input: &str) {
        assert!(input.parse::<ShortId>().is_err());
    }

    #[test]
    fn fingerprint_parses_case_insensitively() {
        assert_eq!("Firefox".parse::<Fingerprint>().expect("parse"), Fingerprint::Firefox);
        assert!("netscape".parse::<Fingerprint>().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn public_key_encoding_roundtrip(bytes in prop::array::uniform32(any::<u8>())) {
                let public = PublicKey::from_bytes_array(bytes);
                let decoded = PublicKey::decode(&public.encode()).expect("decode");
                prop_assert_eq!(public, decoded);
            }
        }
    }
}
