use snafu::{ensure, ResultExt, Snafu};
use std::fmt;
use std::str::FromStr;

/// Number of hexadecimal digits in a key id.
pub const KEY_ID_DIGITS: usize = 16;

/// 64-bit OpenPGP key id.
///
/// Always displayed as `0x` followed by 16 lowercase hexadecimal digits. Parsing is
/// case-insensitive and accepts the `0x` prefix as optional, so `0xDEADBEEF` and
/// `00000000deadbeef` denote the same key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

#[derive(Debug, PartialEq, Snafu)]
pub enum IdError {
    #[snafu(display("key id `{input}` must have between 1 and 16 hexadecimal digits"))]
    Width { input: String },

    #[snafu(display("key id `{input}` is not hexadecimal"))]
    NotHex {
        input: String,
        source: hex::FromHexError,
    },

    #[snafu(display("fingerprint `{input}` is shorter than a key id"))]
    ShortFingerprint { input: String },
}

impl KeyId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Derive the key id from a fingerprint: its trailing 16 hexadecimal digits.
    pub fn from_fingerprint(fingerprint: &str) -> Result<Self, IdError> {
        let digits: String = fingerprint.chars().filter(|c| !c.is_whitespace()).collect();
        ensure!(
            digits.len() >= KEY_ID_DIGITS && digits.is_char_boundary(digits.len() - KEY_ID_DIGITS),
            ShortFingerprintSnafu { input: fingerprint }
        );
        digits[digits.len() - KEY_ID_DIGITS..].parse()
    }
}

impl FromStr for KeyId {
    type Err = IdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let digits = input
            .strip_prefix("0x")
            .or_else(|| input.strip_prefix("0X"))
            .unwrap_or(input);
        ensure!(
            !digits.is_empty() && digits.len() <= KEY_ID_DIGITS,
            WidthSnafu { input }
        );

        // `hex` wants full bytes, left-pad to the fixed width
        let padded = format!("{digits:0>width$}", width = KEY_ID_DIGITS);
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(&padded, &mut bytes).context(NotHexSnafu { input })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.to_be_bytes()))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

impl From<u64> for KeyId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl serde::Serialize for KeyId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for KeyId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string = <String as serde::Deserialize>::deserialize(deserializer)?;
        string.parse().map_err(serde::de::Error::custom)
    }
}

/// Full fingerprint as reported by the key backend on import.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self(fingerprint.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn key_id(&self) -> Result<KeyId, IdError> {
        KeyId::from_fingerprint(&self.0)
    }
}

macro_rules! surrogate_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

surrogate_id!(
    /// Store identifier of a [`Peer`](crate::Peer).
    PeerId
);
surrogate_id!(
    /// Store identifier of a [`MailingList`](crate::MailingList).
    MailingListId
);
surrogate_id!(
    /// Store identifier of a [`Release`](crate::Release).
    ReleaseId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_fixed_width() {
        assert_eq!(KeyId::new(0xdeadbeef).to_string(), "0x00000000deadbeef");
        assert_eq!(KeyId::new(u64::MAX).to_string(), "0xffffffffffffffff");
    }

    #[test]
    fn parse_is_case_insensitive() {
        let lower: KeyId = "0x00000000deadbeef".parse().unwrap();
        let upper: KeyId = "0XDEADBEEF".parse().unwrap();
        let bare: KeyId = "DeadBeef".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, bare);
        assert_eq!(lower.as_u64(), 0xdeadbeef);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!("".parse::<KeyId>(), Err(IdError::Width { .. })));
        assert!(matches!("0x".parse::<KeyId>(), Err(IdError::Width { .. })));
        assert!(matches!(
            "0x0123456789abcdef0".parse::<KeyId>(),
            Err(IdError::Width { .. })
        ));
        assert!(matches!(
            "0xtotomangedugateau".parse::<KeyId>(),
            Err(IdError::Width { .. })
        ));
        assert!(matches!(
            "0xgateau".parse::<KeyId>(),
            Err(IdError::NotHex { .. })
        ));
    }

    #[test]
    fn from_fingerprint_takes_trailing_digits() {
        let fpr = Fingerprint::new("0D9E 0C1A 2B3C 4D5E 6F70 8192 A3B4 C5D6 E7F8 0912");
        assert_eq!(fpr.key_id().unwrap().to_string(), "0xa3b4c5d6e7f80912");

        let fpr = Fingerprint::new("A3B4C5D6E7F8091");
        assert!(matches!(
            fpr.key_id(),
            Err(IdError::ShortFingerprint { .. })
        ));
    }

    #[test]
    fn serde_as_hex_string() {
        let id = KeyId::new(0x0123456789abcdef);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""0x0123456789abcdef""#);
        let back: KeyId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<KeyId>(r#""toto""#).is_err());
    }

    #[test]
    fn surrogate_ids_are_transparent() {
        assert_eq!(serde_json::to_string(&PeerId(7)).unwrap(), "7");
        assert_eq!(ReleaseId(3).to_string(), "3");
    }
}
