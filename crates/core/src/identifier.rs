//! Fixed-width opaque identifiers.
//!
//! An [`Identifier`] is a 22-character base58 string (bitcoin alphabet, so no
//! `0OIl`) encoding 128 bits — either fresh entropy or the big-endian bytes of
//! a UUID. Identifiers are value-typed, ordered lexicographically, and cheap
//! to clone. Claim IDs are minted exclusively through [`Identifier::from_uuid_v5`]
//! so that ingestion is idempotent.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Encoded length of every identifier, in characters.
pub const IDENTIFIER_LEN: usize = 22;

/// The base58 zero symbol used for left-padding short encodings.
const ZERO_SYMBOL: char = '1';

/// Bytes of entropy drawn for a random identifier. Encodes to at least 22
/// base58 characters except for astronomically unlikely leading-zero runs.
const RANDOM_BYTES: usize = 17;

/// Error returned when a string is not a well-formed identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier must be {IDENTIFIER_LEN} characters, got {0}")]
    BadLength(usize),
    #[error("identifier contains forbidden symbol {0:?}")]
    BadSymbol(char),
}

/// A 22-character base58 identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Encode 16 big-endian bytes, left-padding with the base58 zero symbol
    /// to exactly 22 characters.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut s = bs58::encode(&bytes).into_string();
        while s.len() < IDENTIFIER_LEN {
            s.insert(0, ZERO_SYMBOL);
        }
        Identifier(s)
    }

    /// Identifier for a UUID's big-endian bytes.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_bytes(*uuid.as_bytes())
    }

    /// Deterministic identifier for `(namespace, name)` via UUID v5.
    ///
    /// The only minting mechanism for claim IDs and core property IDs: the
    /// same inputs always produce the same identifier.
    pub fn from_uuid_v5(namespace: &Uuid, name: &str) -> Self {
        Self::from_uuid(Uuid::new_v5(namespace, name.as_bytes()))
    }

    /// A fresh random identifier from the OS entropy source.
    ///
    /// Draws 17 bytes and truncates the encoding to 22 characters. Failure to
    /// read entropy is fatal.
    pub fn random() -> Self {
        let mut buf = [0u8; RANDOM_BYTES];
        OsRng.fill_bytes(&mut buf);
        let mut s = bs58::encode(&buf).into_string();
        s.truncate(IDENTIFIER_LEN);
        while s.len() < IDENTIFIER_LEN {
            s.insert(0, ZERO_SYMBOL);
        }
        Identifier(s)
    }

    /// The encoded form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode back to the 16 big-endian bytes this identifier was minted
    /// from. `None` when the identifier does not fit in 128 bits (possible
    /// for truncated random identifiers) — such identifiers are opaque.
    pub fn to_bytes(&self) -> Option<[u8; 16]> {
        let decoded = bs58::decode(&self.0).into_vec().ok()?;
        if decoded.len() <= 16 {
            let mut out = [0u8; 16];
            out[16 - decoded.len()..].copy_from_slice(&decoded);
            return Some(out);
        }
        // Left-padding adds leading zero bytes; only those may be dropped.
        let surplus = decoded.len() - 16;
        if decoded[..surplus].iter().all(|&b| b == 0) {
            let mut out = [0u8; 16];
            out.copy_from_slice(&decoded[surplus..]);
            Some(out)
        } else {
            None
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.chars().count() != IDENTIFIER_LEN {
            return Err(IdentifierError::BadLength(s.chars().count()));
        }
        const ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
        if let Some(bad) = s.chars().find(|c| !ALPHABET.contains(*c)) {
            return Err(IdentifierError::BadSymbol(bad));
        }
        Ok(Identifier(s.to_string()))
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_round_trips_through_string() {
        for _ in 0..64 {
            let id = Identifier::random();
            assert_eq!(id.as_str().len(), IDENTIFIER_LEN);
            let parsed: Identifier = id.as_str().parse().unwrap();
            assert_eq!(parsed, id);
        }
    }

    #[test]
    fn uuid_bytes_round_trip() {
        let uuid = Uuid::new_v4();
        let id = Identifier::from_uuid(uuid);
        assert_eq!(id.as_str().len(), IDENTIFIER_LEN);
        assert_eq!(id.to_bytes(), Some(*uuid.as_bytes()));
    }

    #[test]
    fn zero_bytes_pad_to_full_width() {
        let id = Identifier::from_bytes([0u8; 16]);
        assert_eq!(id.as_str(), "1111111111111111111111");
        assert_eq!(id.to_bytes(), Some([0u8; 16]));
    }

    #[test]
    fn uuid_v5_is_deterministic() {
        let ns = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"peerdb.example");
        let a = Identifier::from_uuid_v5(&ns, "NAME");
        let b = Identifier::from_uuid_v5(&ns, "NAME");
        let c = Identifier::from_uuid_v5(&ns, "DESCRIPTION");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_bad_length_and_symbols() {
        assert!(matches!(
            "short".parse::<Identifier>(),
            Err(IdentifierError::BadLength(5))
        ));
        // 'l' is excluded from the alphabet.
        assert!(matches!(
            "l111111111111111111111".parse::<Identifier>(),
            Err(IdentifierError::BadSymbol('l'))
        ));
        assert!(matches!(
            "0111111111111111111111".parse::<Identifier>(),
            Err(IdentifierError::BadSymbol('0'))
        ));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a: Identifier = "1111111111111111111111".parse().unwrap();
        let b: Identifier = "2111111111111111111111".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn serde_round_trip() {
        let id = Identifier::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Identifier>("\"not base58!\"").is_err());
    }
}
