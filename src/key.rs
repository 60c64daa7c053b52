use crate::backend::{Algorithm, KeyBackend};
use crate::error::{BackendSnafu, IdSnafu, IncompleteKeySnafu, NothingImportedSnafu, Result};
use crate::id::{KeyId, PeerId};
use crate::store::{KeyQuery, Store, StoreError};
use jiff::Timestamp;
use snafu::{ensure, ResultExt};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A key, as known to the release engine.
///
/// Only the key id and a cache of the key's metadata live here, all key material stays in
/// the [`KeyBackend`]. Records are equal when their key ids are, and ordered by creation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyRecord {
    id: KeyId,
    name: String,
    email: String,

    #[serde(with = "crate::timestamp::required")]
    created_at: Timestamp,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    peer: Option<PeerId>,
}

/// Maker of a signature on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signer {
    /// Signer has a record in the store, or is the key itself.
    Known(KeyRecord),
    /// Signer is only known to the backend.
    Unknown(KeyId),
}

impl KeyRecord {
    /// Build a record from explicit metadata, without asking the backend.
    pub fn new(
        id: KeyId,
        name: impl AsRef<str>,
        email: impl AsRef<str>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            name: name.as_ref().trim().to_string(),
            email: email.as_ref().trim().to_string(),
            created_at,
            peer: None,
        }
    }

    /// Build a record from the metadata the backend holds for `id`.
    pub fn from_backend(backend: &dyn KeyBackend, id: KeyId) -> Result<Self> {
        let uid = backend.uid(id).context(BackendSnafu)?;
        let created_at = backend.created_at(id).context(BackendSnafu)?;
        Ok(Self::new(id, uid.name, uid.email, created_at))
    }

    /// Build a record from the backend if it knows `id`, from the given metadata otherwise.
    pub fn resolve(
        backend: &dyn KeyBackend,
        id: KeyId,
        name: Option<&str>,
        email: Option<&str>,
        created_at: Option<Timestamp>,
    ) -> Result<Self> {
        if backend.exists(id) {
            return Self::from_backend(backend, id);
        }
        match (name, email, created_at) {
            (Some(name), Some(email), Some(created_at)) => {
                Ok(Self::new(id, name, email, created_at))
            }
            _ => IncompleteKeySnafu { id }.fail(),
        }
    }

    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    /// The stored key with this id. More than one match means the store is inconsistent.
    pub fn from_id(store: &dyn Store, id: KeyId) -> Result<Self> {
        Ok(store.find_one_key(KeyQuery::Id(id))?)
    }

    /// A stored key with this name, the first one if there are several.
    pub fn from_name(store: &dyn Store, name: &str) -> Result<Self> {
        Ok(store.find_one_key(KeyQuery::Name(name))?)
    }

    /// A stored key for this address, the first one if there are several.
    pub fn from_email(store: &dyn Store, email: &str) -> Result<Self> {
        Ok(store.find_one_key(KeyQuery::Email(email))?)
    }

    /// Import key material into the backend and return a record for every imported key.
    ///
    /// Keys already known to the store are returned as stored, others are built from the
    /// backend. The returned records are not saved.
    pub fn import(
        backend: &mut dyn KeyBackend,
        store: &dyn Store,
        data: &[u8],
    ) -> Result<Vec<Self>> {
        let fingerprints = backend.import(data).context(BackendSnafu)?;
        ensure!(!fingerprints.is_empty(), NothingImportedSnafu);

        fingerprints
            .iter()
            .map(|fingerprint| {
                let id = fingerprint.key_id().context(IdSnafu)?;
                match store.find_one_key(KeyQuery::Id(id)) {
                    Ok(key) => Ok(key),
                    Err(StoreError::NotFound { .. }) => Self::from_backend(&*backend, id),
                    Err(err) => Err(err.into()),
                }
            })
            .collect()
    }

    /// At least one valid subkey for signing and one for encrypting.
    pub fn is_okay(&self, backend: &dyn KeyBackend) -> Result<bool> {
        Ok(backend.is_usable(self.id)?)
    }

    pub fn is_expired(&self, backend: &dyn KeyBackend) -> Result<bool> {
        Ok(backend.is_expired(self.id)?)
    }

    /// Usable and trusted.
    pub fn is_valid(&self, backend: &dyn KeyBackend) -> Result<bool> {
        Ok(self.is_okay(backend)? && backend.validity(self.id)? > 0)
    }

    pub fn min_length(&self, backend: &dyn KeyBackend) -> Result<u32> {
        Ok(backend.min_length(self.id)?)
    }

    pub fn expires_at(&self, backend: &dyn KeyBackend) -> Result<Option<Timestamp>> {
        Ok(backend.expires_at(self.id)?)
    }

    pub fn algorithms(&self, backend: &dyn KeyBackend) -> Result<BTreeSet<Algorithm>> {
        Ok(backend.algorithms(self.id)?)
    }

    pub fn is_signed_by(&self, backend: &dyn KeyBackend, signer: &KeyRecord) -> Result<bool> {
        Ok(backend.is_signed_by(self.id, signer.id)?)
    }

    pub fn sign(&self, backend: &mut dyn KeyBackend, signer: &KeyRecord) -> Result<()> {
        Ok(backend.sign(self.id, signer.id)?)
    }

    pub fn revoke_signature(
        &self,
        backend: &mut dyn KeyBackend,
        signer: &KeyRecord,
        reason: &str,
    ) -> Result<()> {
        Ok(backend.revoke_signature(self.id, signer.id, reason)?)
    }

    pub fn delete_signature(&self, backend: &mut dyn KeyBackend, signer: KeyId) -> Result<()> {
        Ok(backend.delete_signature(self.id, signer)?)
    }

    /// Everyone who signed this key.
    pub fn signatures(&self, backend: &dyn KeyBackend, store: &dyn Store) -> Result<Vec<Signer>> {
        backend
            .list_signers(self.id)?
            .into_iter()
            .map(|signer| {
                if signer == self.id {
                    return Ok(Signer::Known(self.clone()));
                }
                match store.find_one_key(KeyQuery::Id(signer)) {
                    Ok(key) => Ok(Signer::Known(key)),
                    Err(StoreError::NotFound { .. }) => Ok(Signer::Unknown(signer)),
                    Err(err) => Err(err.into()),
                }
            })
            .collect()
    }
}

impl PartialEq for KeyRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KeyRecord {}

impl Hash for KeyRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for KeyRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} <{}>", self.id, self.name, self.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;
    use crate::testing::{FakeKey, MemoryBackend};

    fn timestamp(second: i64) -> Timestamp {
        Timestamp::from_second(second).unwrap()
    }

    #[test]
    fn explicit_construction_trims() {
        let key = KeyRecord::new(KeyId::new(1), " Toto ", "toto@example.org\n", timestamp(0));
        assert_eq!(key.name(), "Toto");
        assert_eq!(key.email(), "toto@example.org");
        assert!(key.peer().is_none());
        assert_eq!(key.to_string(), "0x0000000000000001: Toto <toto@example.org>");
    }

    #[test]
    fn resolve_prefers_backend() {
        let mut backend = MemoryBackend::new();
        backend.add(KeyId::new(1), FakeKey::new("Phil", "phil@example.org"));

        let key = KeyRecord::resolve(&backend, KeyId::new(1), Some("Toto"), None, None).unwrap();
        assert_eq!(key.name(), "Phil");

        let key = KeyRecord::resolve(
            &backend,
            KeyId::new(2),
            Some("Toto"),
            Some("toto@example.org"),
            Some(timestamp(0)),
        )
        .unwrap();
        assert_eq!(key.name(), "Toto");

        let err = KeyRecord::resolve(&backend, KeyId::new(3), Some("Toto"), None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConstruction);
    }

    #[test]
    fn equality_by_id_order_by_creation() {
        let old = KeyRecord::new(KeyId::new(9), "Old", "old@example.org", timestamp(100));
        let new = KeyRecord::new(KeyId::new(1), "New", "new@example.org", timestamp(200));
        let renamed = KeyRecord::new(KeyId::new(9), "Renamed", "old@example.org", timestamp(100));

        assert_eq!(old, renamed);
        assert!(old < new);
        let mut keys = vec![new.clone(), old.clone()];
        keys.sort();
        assert_eq!(keys, vec![old, new]);
    }

    #[test]
    fn serde_json() {
        let key = KeyRecord::new(KeyId::new(0xabc), "Toto", "toto@example.org", timestamp(1735037098))
            .with_peer(PeerId(4));
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(
            json,
            r#"{"id":"0x0000000000000abc","name":"Toto","email":"toto@example.org","created_at":"2024-12-24T10:44:58Z","peer":4}"#
        );

        let json = r#"{"id":"0xABC","name":"Toto","email":"toto@example.org","created_at":"2024-12-24T10:44:58Z"}"#;
        let imported: KeyRecord = serde_json::from_str(json).unwrap();
        assert_eq!(imported, key);
        assert!(imported.peer().is_none());
    }

    #[test]
    fn import_reuses_stored_records() {
        let mut backend = MemoryBackend::new();
        let mut store = MemoryStore::new();
        let stored = KeyRecord::new(KeyId::new(0x1111), "Stored", "s@example.org", timestamp(0))
            .with_peer(PeerId(1));
        store.save_key(stored.clone()).unwrap();

        let data = b"0D9E0C1A2B3C4D5E6F7081920000000000001111 Stored <s@example.org>\n\
                     0D9E0C1A2B3C4D5E6F7081920000000000002222 Fresh <f@example.org>\n";
        let keys = KeyRecord::import(&mut backend, &store, data).unwrap();

        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].peer(), Some(PeerId(1)));
        assert_eq!(keys[1].id(), KeyId::new(0x2222));
        assert_eq!(keys[1].name(), "Fresh");

        let err = KeyRecord::import(&mut backend, &store, b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn valid_needs_trust() {
        let mut backend = MemoryBackend::new();
        backend.add(KeyId::new(1), FakeKey::new("Toto", "toto@example.org"));
        backend.add(KeyId::new(2), FakeKey::new("Tata", "tata@example.org").untrusted());
        backend.add(KeyId::new(3), FakeKey::new("Titi", "titi@example.org").expired());

        let valid = |id| {
            KeyRecord::from_backend(&backend, KeyId::new(id))
                .unwrap()
                .is_valid(&backend)
                .unwrap()
        };
        assert!(valid(1));
        assert!(!valid(2));
        assert!(!valid(3));

        let expired = KeyRecord::from_backend(&backend, KeyId::new(3)).unwrap();
        assert!(expired.is_expired(&backend).unwrap());
        assert!(!expired.is_okay(&backend).unwrap());
    }

    #[test]
    fn signatures_resolve_known_signers() {
        let mut backend = MemoryBackend::new();
        let mut store = MemoryStore::new();
        let ca = KeyId::new(0xca);
        backend.add(ca, FakeKey::new("CA", "ca@example.org"));
        backend.add(
            KeyId::new(1),
            FakeKey::new("Toto", "toto@example.org").signed_by(ca).signed_by(KeyId::new(1)),
        );
        let key = KeyRecord::from_backend(&backend, KeyId::new(1)).unwrap();
        let ca_key = KeyRecord::from_backend(&backend, ca).unwrap();

        let signers = key.signatures(&backend, &store).unwrap();
        assert!(signers.contains(&Signer::Unknown(ca)));
        assert!(signers.contains(&Signer::Known(key.clone())));

        store.save_key(ca_key.clone()).unwrap();
        let signers = key.signatures(&backend, &store).unwrap();
        assert!(signers.contains(&Signer::Known(ca_key.clone())));

        key.revoke_signature(&mut backend, &ca_key, "superseded").unwrap();
        assert!(!key.is_signed_by(&backend, &ca_key).unwrap());
    }
}
