use crate::id::{Fingerprint, KeyId};
use jiff::Timestamp;
use snafu::Snafu;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// User id of a key as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Uid {
    pub name: String,
    pub email: String,
}

/// Public key algorithm of a (sub)key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub enum Algorithm {
    Rsa,
    RsaEncrypt,
    RsaSign,
    ElGamalEncrypt,
    Dsa,
    Ecdh,
    Ecdsa,
    ElGamal,
    EdDsa,
}

impl Algorithm {
    pub const ALL: [Algorithm; 9] = [
        Algorithm::Rsa,
        Algorithm::RsaEncrypt,
        Algorithm::RsaSign,
        Algorithm::ElGamalEncrypt,
        Algorithm::Dsa,
        Algorithm::Ecdh,
        Algorithm::Ecdsa,
        Algorithm::ElGamal,
        Algorithm::EdDsa,
    ];

    /// OpenPGP public key algorithm number (RFC 4880 section 9.1).
    pub fn code(&self) -> u8 {
        match self {
            Algorithm::Rsa => 1,
            Algorithm::RsaEncrypt => 2,
            Algorithm::RsaSign => 3,
            Algorithm::ElGamalEncrypt => 16,
            Algorithm::Dsa => 17,
            Algorithm::Ecdh => 18,
            Algorithm::Ecdsa => 19,
            Algorithm::ElGamal => 20,
            Algorithm::EdDsa => 22,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Rsa => "RSA",
            Algorithm::RsaEncrypt => "RSA-E",
            Algorithm::RsaSign => "RSA-S",
            Algorithm::ElGamalEncrypt => "ELG-E",
            Algorithm::Dsa => "DSA",
            Algorithm::Ecdh => "ECDH",
            Algorithm::Ecdsa => "ECDSA",
            Algorithm::ElGamal => "ELG",
            Algorithm::EdDsa => "EdDSA",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, PartialEq, Eq, Snafu)]
#[snafu(display("algorithm `{input}` is unknown, supported algorithms are {}", supported()))]
pub struct UnknownAlgorithm {
    input: String,
}

fn supported() -> String {
    Algorithm::ALL
        .iter()
        .map(Algorithm::name)
        .collect::<Vec<_>>()
        .join(", ")
}

impl FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(input))
            .ok_or_else(|| UnknownAlgorithm {
                input: input.to_string(),
            })
    }
}

impl TryFrom<String> for Algorithm {
    type Error = UnknownAlgorithm;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Algorithm> for String {
    fn from(value: Algorithm) -> Self {
        value.name().to_string()
    }
}

#[derive(Debug, Snafu)]
pub enum BackendError {
    #[snafu(display("key {id} is unknown to the key backend"))]
    UnknownKey { id: KeyId },

    #[snafu(display("key backend failed to {operation}: {message}"))]
    Operation {
        operation: &'static str,
        message: String,
    },
}

/// Capabilities of the key-management backend owning all key material.
///
/// The release engine never touches key material itself, it only asks the backend about
/// keys and asks it to perform operations on them. Methods taking `&mut self` modify the
/// backend's keyring.
pub trait KeyBackend {
    /// Whether the backend holds key material for `id`.
    fn exists(&self, id: KeyId) -> bool;

    fn uid(&self, id: KeyId) -> Result<Uid, BackendError>;

    fn created_at(&self, id: KeyId) -> Result<Timestamp, BackendError>;

    /// At least one valid (not revoked, expired or disabled) subkey for signing and one for
    /// encryption.
    fn is_usable(&self, id: KeyId) -> Result<bool, BackendError>;

    /// All encryption subkeys are expired.
    fn is_expired(&self, id: KeyId) -> Result<bool, BackendError>;

    /// Minimum length in bits over all subkeys.
    fn min_length(&self, id: KeyId) -> Result<u32, BackendError>;

    /// Nearest expiration over the expiring encryption subkeys, `None` if none expires.
    fn expires_at(&self, id: KeyId) -> Result<Option<Timestamp>, BackendError>;

    /// Algorithms of the active subkeys.
    fn algorithms(&self, id: KeyId) -> Result<BTreeSet<Algorithm>, BackendError>;

    /// Whether any user id of `id` carries a valid signature made by `signer`.
    fn is_signed_by(&self, id: KeyId, signer: KeyId) -> Result<bool, BackendError>;

    /// Owner trust level, zero meaning unknown or untrusted.
    fn validity(&self, id: KeyId) -> Result<u8, BackendError>;

    fn sign(&mut self, id: KeyId, signer: KeyId) -> Result<(), BackendError>;

    fn revoke_signature(
        &mut self,
        id: KeyId,
        signer: KeyId,
        reason: &str,
    ) -> Result<(), BackendError>;

    fn delete_signature(&mut self, id: KeyId, signer: KeyId) -> Result<(), BackendError>;

    /// Key ids of every key that signed a user id of `id`.
    fn list_signers(&self, id: KeyId) -> Result<BTreeSet<KeyId>, BackendError>;

    /// Add key material to the keyring, returning the fingerprints of the imported keys.
    fn import(&mut self, data: &[u8]) -> Result<Vec<Fingerprint>, BackendError>;

    fn export(&self, ids: &[KeyId]) -> Result<Vec<u8>, BackendError>;

    fn encrypt(&self, data: &[u8], recipients: &[KeyId]) -> Result<Vec<u8>, BackendError>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BackendError>;

    fn sign_message(&self, data: &[u8], signer: KeyId) -> Result<Vec<u8>, BackendError>;

    /// Key ids of the keys which produced valid `signature`s over `data`.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<Vec<KeyId>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names_round_trip() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.name().parse::<Algorithm>().unwrap(), algorithm);
        }
        assert_eq!("rsa".parse::<Algorithm>().unwrap(), Algorithm::Rsa);
        assert_eq!("EDDSA".parse::<Algorithm>().unwrap(), Algorithm::EdDsa);
    }

    #[test]
    fn unknown_algorithm_lists_supported() {
        let err = "IDEA".parse::<Algorithm>().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("IDEA"));
        assert!(message.contains("RSA, RSA-E"));
    }

    #[test]
    fn algorithm_serde_by_name() {
        let json = serde_json::to_string(&BTreeSet::from([Algorithm::Dsa, Algorithm::Rsa])).unwrap();
        assert_eq!(json, r#"["RSA","DSA"]"#);
        let algorithms: BTreeSet<Algorithm> = serde_json::from_str(r#"["ecdsa"]"#).unwrap();
        assert_eq!(algorithms, BTreeSet::from([Algorithm::Ecdsa]));
        assert!(serde_json::from_str::<Algorithm>(r#""IDEA""#).is_err());
    }

    #[test]
    fn algorithm_codes() {
        assert_eq!(Algorithm::Rsa.code(), 1);
        assert_eq!(Algorithm::Dsa.code(), 17);
        assert_eq!(Algorithm::EdDsa.code(), 22);
    }
}
