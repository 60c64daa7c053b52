//! In-memory key backend for tests and demos.
//!
//! Key material is replaced by plain text: an exported key is one line
//! `FINGERPRINT Name <email>`, and importing parses the same lines back.

use crate::backend::{Algorithm, BackendError, KeyBackend, Uid};
use crate::id::{Fingerprint, KeyId};
use jiff::civil::Date;
use jiff::tz::TimeZone;
use jiff::Timestamp;
use std::collections::{BTreeMap, BTreeSet};

/// Signature header of [`MemoryBackend::sign_message`] output.
const SIGNATURE_PREFIX: &str = "signed-by ";
const ENCRYPTION_PREFIX: &str = "encrypted-to ";

/// What the backend knows about one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeKey {
    uid: Uid,
    created_at: Timestamp,
    usable: bool,
    expired: bool,
    length: u32,
    algorithms: BTreeSet<Algorithm>,
    expires_at: Option<Timestamp>,
    validity: u8,
    /// Signer and whether the signature was revoked
    signers: BTreeMap<KeyId, bool>,
}

impl FakeKey {
    /// A usable 4096 bit RSA key created on 2020-01-01, never expiring, signed by no one.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            uid: Uid {
                name: name.into(),
                email: email.into(),
            },
            created_at: Timestamp::from_second(1_577_836_800).unwrap_or(Timestamp::UNIX_EPOCH),
            usable: true,
            expired: false,
            length: 4096,
            algorithms: BTreeSet::from([Algorithm::Rsa]),
            expires_at: None,
            validity: 4,
            signers: BTreeMap::new(),
        }
    }

    pub fn created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn unusable(mut self) -> Self {
        self.usable = false;
        self
    }

    /// Expired, and therefore unusable.
    pub fn expired(mut self) -> Self {
        self.expired = true;
        self.usable = false;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    /// Expires at midnight UTC on `date`.
    pub fn expires(mut self, date: Date) -> Self {
        self.expires_at = date
            .to_zoned(TimeZone::UTC)
            .ok()
            .map(|zoned| zoned.timestamp());
        self
    }

    pub fn algorithms(mut self, algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        self.algorithms = algorithms.into_iter().collect();
        self
    }

    pub fn signed_by(mut self, signer: KeyId) -> Self {
        self.signers.insert(signer, false);
        self
    }

    pub fn untrusted(mut self) -> Self {
        self.validity = 0;
        self
    }

    pub fn set_usable(&mut self, usable: bool) {
        self.usable = usable;
    }

    pub fn set_length(&mut self, length: u32) {
        self.length = length;
    }

    pub fn remove_signer(&mut self, signer: KeyId) {
        self.signers.remove(&signer);
    }
}

/// A [`KeyBackend`] holding [`FakeKey`]s.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    keys: BTreeMap<KeyId, FakeKey>,
}

fn fingerprint(id: KeyId) -> String {
    format!("{:040X}", id.as_u64())
}

fn operation(operation: &'static str, message: impl Into<String>) -> BackendError {
    BackendError::Operation {
        operation,
        message: message.into(),
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: KeyId, key: FakeKey) {
        self.keys.insert(id, key);
    }

    pub fn key_mut(&mut self, id: KeyId) -> Option<&mut FakeKey> {
        self.keys.get_mut(&id)
    }

    fn key(&self, id: KeyId) -> Result<&FakeKey, BackendError> {
        self.keys.get(&id).ok_or(BackendError::UnknownKey { id })
    }

    fn key_entry(&mut self, id: KeyId) -> Result<&mut FakeKey, BackendError> {
        self.keys.get_mut(&id).ok_or(BackendError::UnknownKey { id })
    }

    /// Split off the header line written by `sign_message` or `encrypt`.
    fn header<'a>(data: &'a [u8], prefix: &str) -> Option<(&'a str, &'a [u8])> {
        let end = data.iter().position(|b| *b == b'\n')?;
        let line = std::str::from_utf8(&data[..end]).ok()?;
        Some((line.strip_prefix(prefix)?, &data[end + 1..]))
    }

    fn parse_ids(ids: &str) -> Result<Vec<KeyId>, BackendError> {
        ids.split(',')
            .map(|id| id.parse().map_err(|_| operation("parse", format!("bad key id '{id}'"))))
            .collect()
    }
}

impl KeyBackend for MemoryBackend {
    fn exists(&self, id: KeyId) -> bool {
        self.keys.contains_key(&id)
    }

    fn uid(&self, id: KeyId) -> Result<Uid, BackendError> {
        Ok(self.key(id)?.uid.clone())
    }

    fn created_at(&self, id: KeyId) -> Result<Timestamp, BackendError> {
        Ok(self.key(id)?.created_at)
    }

    fn is_usable(&self, id: KeyId) -> Result<bool, BackendError> {
        Ok(self.key(id)?.usable)
    }

    fn is_expired(&self, id: KeyId) -> Result<bool, BackendError> {
        Ok(self.key(id)?.expired)
    }

    fn min_length(&self, id: KeyId) -> Result<u32, BackendError> {
        Ok(self.key(id)?.length)
    }

    fn expires_at(&self, id: KeyId) -> Result<Option<Timestamp>, BackendError> {
        Ok(self.key(id)?.expires_at)
    }

    fn algorithms(&self, id: KeyId) -> Result<BTreeSet<Algorithm>, BackendError> {
        Ok(self.key(id)?.algorithms.clone())
    }

    fn is_signed_by(&self, id: KeyId, signer: KeyId) -> Result<bool, BackendError> {
        Ok(self.key(id)?.signers.get(&signer) == Some(&false))
    }

    fn validity(&self, id: KeyId) -> Result<u8, BackendError> {
        Ok(self.key(id)?.validity)
    }

    fn sign(&mut self, id: KeyId, signer: KeyId) -> Result<(), BackendError> {
        self.key(signer)?;
        self.key_entry(id)?.signers.insert(signer, false);
        Ok(())
    }

    fn revoke_signature(
        &mut self,
        id: KeyId,
        signer: KeyId,
        _reason: &str,
    ) -> Result<(), BackendError> {
        match self.key_entry(id)?.signers.get_mut(&signer) {
            Some(revoked) => {
                *revoked = true;
                Ok(())
            }
            None => Err(operation("revoke signature", format!("{signer} did not sign {id}"))),
        }
    }

    fn delete_signature(&mut self, id: KeyId, signer: KeyId) -> Result<(), BackendError> {
        self.key_entry(id)?.signers.remove(&signer);
        Ok(())
    }

    fn list_signers(&self, id: KeyId) -> Result<BTreeSet<KeyId>, BackendError> {
        Ok(self.key(id)?.signers.keys().copied().collect())
    }

    fn import(&mut self, data: &[u8]) -> Result<Vec<Fingerprint>, BackendError> {
        let text = std::str::from_utf8(data).map_err(|err| operation("import", err.to_string()))?;

        let mut imported = Vec::new();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let (fpr, uid) = line
                .split_once(' ')
                .ok_or_else(|| operation("import", format!("malformed key '{line}'")))?;
            let (name, email) = uid
                .split_once('<')
                .ok_or_else(|| operation("import", format!("malformed user id '{uid}'")))?;

            let fpr = Fingerprint::new(fpr);
            let id = fpr
                .key_id()
                .map_err(|err| operation("import", err.to_string()))?;
            self.keys
                .entry(id)
                .or_insert_with(|| FakeKey::new(name.trim(), email.trim_end_matches('>').trim()));
            imported.push(fpr);
        }
        Ok(imported)
    }

    fn export(&self, ids: &[KeyId]) -> Result<Vec<u8>, BackendError> {
        let mut out = String::new();
        for id in ids {
            let key = self.key(*id)?;
            out.push_str(&format!(
                "{} {} <{}>\n",
                fingerprint(*id),
                key.uid.name,
                key.uid.email
            ));
        }
        Ok(out.into_bytes())
    }

    fn encrypt(&self, data: &[u8], recipients: &[KeyId]) -> Result<Vec<u8>, BackendError> {
        for id in recipients {
            if !self.key(*id)?.usable {
                return Err(operation("encrypt", format!("key {id} is not usable")));
            }
        }
        let ids: Vec<String> = recipients.iter().map(ToString::to_string).collect();
        let mut out = format!("{ENCRYPTION_PREFIX}{}\n", ids.join(",")).into_bytes();
        out.extend_from_slice(data);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BackendError> {
        let (ids, body) = Self::header(data, ENCRYPTION_PREFIX)
            .ok_or_else(|| operation("decrypt", "not an encrypted message"))?;
        let recipients = Self::parse_ids(ids)?;
        if !recipients.iter().any(|id| self.exists(*id)) {
            return Err(operation("decrypt", "no secret key for any recipient"));
        }
        Ok(body.to_vec())
    }

    fn sign_message(&self, _data: &[u8], signer: KeyId) -> Result<Vec<u8>, BackendError> {
        self.key(signer)?;
        Ok(format!("{SIGNATURE_PREFIX}{signer}\n").into_bytes())
    }

    fn verify(&self, _data: &[u8], signature: &[u8]) -> Result<Vec<KeyId>, BackendError> {
        let (ids, _) = Self::header(signature, SIGNATURE_PREFIX)
            .ok_or_else(|| operation("verify", "not a signature"))?;
        Ok(Self::parse_ids(ids)?
            .into_iter()
            .filter(|id| self.exists(*id))
            .collect())
    }
}
