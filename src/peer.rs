use crate::backend::KeyBackend;
use crate::error::{ConflictingMergeSnafu, MissingPeerSnafu, Result, UnpersistedSnafu};
use crate::id::{PeerId, ReleaseId};
use crate::key::KeyRecord;
use crate::release::Release;
use crate::store::{KeyQuery, PeerQuery, Store, StoreError};
use snafu::{ensure, OptionExt};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// A person participating in mailing lists, owning one or more keys over time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<PeerId>,
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl Peer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            details: Vec::new(),
        }
    }

    /// Free-form details, shown after the name.
    pub fn with_details<I, S>(mut self, details: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.details = details.into_iter().map(Into::into).collect();
        self
    }

    /// Used by stores to hand out their identifier.
    pub fn with_id(mut self, id: PeerId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<PeerId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn details(&self) -> &[String] {
        &self.details
    }

    /// The peer owning `key`.
    pub fn from_key(store: &dyn Store, key: &KeyRecord) -> Result<Self> {
        let id = key.peer().context(MissingPeerSnafu { key: key.id() })?;
        Ok(store.find_one_peer(PeerQuery::Id(id))?)
    }

    /// A peer with this name, the first one if there are several.
    pub fn from_name(store: &dyn Store, name: &str) -> Result<Self> {
        Ok(store.find_one_peer(PeerQuery::Name(name))?)
    }

    /// A peer owning a key for this address, the first one if there are several.
    pub fn from_email(store: &dyn Store, email: &str) -> Result<Self> {
        Ok(store.find_one_peer(PeerQuery::Email(email))?)
    }

    /// Keys of this peer, oldest first.
    pub fn keys(&self, store: &dyn Store) -> Result<Vec<KeyRecord>> {
        let id = self.persisted_id()?;
        let mut keys = store.find_keys(KeyQuery::Peer(id))?;
        keys.sort();
        Ok(keys)
    }

    /// The most recent okay key of this peer, or its most recent key if none is okay.
    pub fn key(&self, backend: &dyn KeyBackend, store: &dyn Store) -> Result<KeyRecord> {
        let keys = self.keys(store)?;
        for key in keys.iter().rev() {
            if key.is_okay(backend)? {
                return Ok(key.clone());
            }
        }
        match keys.last() {
            Some(key) => Ok(key.clone()),
            None => Err(StoreError::NotFound {
                entity: "key",
                query: KeyQuery::Peer(self.persisted_id()?).to_string(),
            }
            .into()),
        }
    }

    /// Address of the key returned by [`Peer::key`].
    pub fn email(&self, backend: &dyn KeyBackend, store: &dyn Store) -> Result<String> {
        Ok(self.key(backend, store)?.email().to_string())
    }

    /// Combine two peers, favouring `left` wherever both have data.
    ///
    /// The result is a new peer without an id; see [`merge_peers`] to apply a merge to a
    /// store.
    pub fn merge(left: &Peer, right: &Peer) -> Peer {
        let len = left.details.len().max(right.details.len());
        let details = (0..len)
            .map(|i| {
                let l = left.details.get(i).filter(|d| !d.is_empty());
                let r = right.details.get(i);
                l.or(r).cloned().unwrap_or_default()
            })
            .collect();

        Peer {
            id: None,
            name: left.name.clone(),
            details,
        }
    }

    fn persisted_id(&self) -> Result<PeerId> {
        self.id.context(UnpersistedSnafu {
            what: format!("peer '{}'", self.name),
        })
    }
}

/// Replace `left` and `right` by their merge, moving all their keys to the merged peer.
///
/// Stored releases holding those keys are rewritten to point at the merged peer. If a
/// release has an active key of both peers, nothing is changed and the merge fails.
/// Releases not inserted into the store yet keep the old owners.
pub fn merge_peers(store: &mut dyn Store, left: &Peer, right: &Peer) -> Result<Peer> {
    let (left_id, right_id) = (left.persisted_id()?, right.persisted_id()?);
    let mut keys = left.keys(&*store)?;
    keys.extend(right.keys(&*store)?);

    let mut releases: BTreeMap<ReleaseId, Release> = BTreeMap::new();
    for key in &keys {
        for release in store.releases_with_key(key.id())? {
            if let Some(id) = release.id() {
                releases.entry(id).or_insert(release);
            }
        }
    }
    for release in releases.values() {
        let owns = |peer: PeerId| release.active_keys().any(|k| k.peer() == Some(peer));
        ensure!(
            !(owns(left_id) && owns(right_id)),
            ConflictingMergeSnafu {
                left: left_id,
                right: right_id,
                date: release.date()
            }
        );
    }

    let merged = store.save_peer(Peer::merge(left, right))?;
    let id = merged.persisted_id()?;
    let keys: Vec<KeyRecord> = keys.into_iter().map(|key| key.with_peer(id)).collect();
    for key in &keys {
        store.save_key(key.clone())?;
    }
    for release in releases.values_mut() {
        for key in &keys {
            release.refresh_key(key);
        }
        store.save_release(release)?;
    }
    for old in [left_id, right_id] {
        store.delete_peer(old)?;
    }

    debug!(
        peer = %id,
        "merged peers {left_id} and {right_id}, {} releases updated",
        releases.len()
    );
    Ok(merged)
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let details: Vec<&str> = self
            .details
            .iter()
            .map(String::as_str)
            .filter(|d| !d.is_empty())
            .collect();
        if details.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} - {}", self.name, details.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::id::{KeyId, MailingListId};
    use crate::memory::MemoryStore;
    use crate::policy::Policy;
    use crate::testing::{FakeKey, MemoryBackend};
    use jiff::civil::{date, Date};
    use jiff::Timestamp;

    const LIST: MailingListId = MailingListId(1);

    fn key(id: u64, second: i64, peer: PeerId) -> KeyRecord {
        KeyRecord::new(
            KeyId::new(id),
            format!("Key {id}"),
            "toto@example.org",
            Timestamp::from_second(second).unwrap(),
        )
        .with_peer(peer)
    }

    fn release(day: Date, active: &[&KeyRecord], inactive: &[&KeyRecord]) -> Release {
        let ca = KeyRecord::new(KeyId::new(0xca), "CA", "ca@example.org", Timestamp::UNIX_EPOCH);
        Release::new(
            LIST,
            day,
            Policy::new("test", date(2020, 1, 1), ca, 0, 0, []),
            active.iter().map(|k| (*k).clone()),
            inactive.iter().map(|k| (*k).clone()),
        )
        .unwrap()
    }

    #[test]
    fn display_skips_empty_details() {
        let peer = Peer::new("Toto").with_details(["", "Lyon", "", "cake"]);
        assert_eq!(peer.to_string(), "Toto - Lyon, cake");
        assert_eq!(Peer::new("Toto").to_string(), "Toto");
    }

    #[test]
    fn merge_favours_left() {
        let left = Peer::new("Toto").with_details(["", "Lyon"]);
        let right = Peer::new("Tata").with_details(["cake", "Paris", "extra"]);
        let merged = Peer::merge(&left, &right);
        assert_eq!(merged.name(), "Toto");
        assert_eq!(merged.details(), ["cake", "Lyon", "extra"]);
        assert!(merged.id().is_none());
    }

    #[test]
    fn key_prefers_recent_okay_key() {
        let mut store = MemoryStore::new();
        let mut backend = MemoryBackend::new();
        let peer = store.save_peer(Peer::new("Toto")).unwrap();
        let id = peer.id().unwrap();

        backend.add(KeyId::new(1), FakeKey::new("Toto", "toto@example.org"));
        backend.add(KeyId::new(2), FakeKey::new("Toto", "toto@example.org").unusable());
        store.save_key(key(1, 100, id)).unwrap();
        store.save_key(key(2, 200, id)).unwrap();

        assert_eq!(peer.key(&backend, &store).unwrap().id(), KeyId::new(1));

        backend.key_mut(KeyId::new(1)).unwrap().set_usable(false);
        assert_eq!(peer.key(&backend, &store).unwrap().id(), KeyId::new(2));
    }

    #[test]
    fn from_key_requires_peer() {
        let store = MemoryStore::new();
        let orphan = KeyRecord::new(KeyId::new(1), "Toto", "t@example.org", Timestamp::UNIX_EPOCH);
        let err = Peer::from_key(&store, &orphan).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConstruction);
    }

    #[test]
    fn unsaved_peer_has_no_keys() {
        let store = MemoryStore::new();
        let err = Peer::new("Toto").keys(&store).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[test]
    fn merge_peers_moves_keys() {
        let mut store = MemoryStore::new();
        let left = store.save_peer(Peer::new("Toto")).unwrap();
        let right = store.save_peer(Peer::new("Tata")).unwrap();
        store.save_key(key(1, 100, left.id().unwrap())).unwrap();
        store.save_key(key(2, 200, right.id().unwrap())).unwrap();

        let merged = merge_peers(&mut store, &left, &right).unwrap();
        let keys = merged.keys(&store).unwrap();
        assert_eq!(
            keys.iter().map(KeyRecord::id).collect::<Vec<_>>(),
            vec![KeyId::new(1), KeyId::new(2)]
        );
        assert!(Peer::from_name(&store, "Tata").is_err());
        assert_eq!(Peer::from_email(&store, "toto@example.org").unwrap(), merged);
    }

    #[test]
    fn merge_peers_rewrites_stored_releases() {
        let mut store = MemoryStore::new();
        let left = store.save_peer(Peer::new("Toto")).unwrap();
        let right = store.save_peer(Peer::new("Tata")).unwrap();
        let old = key(1, 100, left.id().unwrap());
        let new = key(2, 200, right.id().unwrap());
        store.save_key(old.clone()).unwrap();
        store.save_key(new.clone()).unwrap();
        store.insert_release(release(date(2020, 1, 1), &[&old], &[])).unwrap();
        store.insert_release(release(date(2020, 2, 1), &[&new], &[&old])).unwrap();

        let merged = merge_peers(&mut store, &left, &right).unwrap();
        for release in store.releases(LIST).unwrap() {
            assert!(release.keys().all(|k| k.peer() == merged.id()));
            assert!(release.contains(&store, &merged).unwrap());
            assert!(!release.contains(&store, &left).unwrap());
        }
    }

    #[test]
    fn merge_peers_refuses_two_active_keys_in_one_release() {
        let mut store = MemoryStore::new();
        let left = store.save_peer(Peer::new("Toto")).unwrap();
        let right = store.save_peer(Peer::new("Tata")).unwrap();
        let k1 = key(1, 100, left.id().unwrap());
        let k2 = key(2, 200, right.id().unwrap());
        store.save_key(k1.clone()).unwrap();
        store.save_key(k2.clone()).unwrap();
        let stored = store.insert_release(release(date(2020, 1, 1), &[&k1, &k2], &[])).unwrap();

        let err = merge_peers(&mut store, &left, &right).unwrap_err();
        assert!(matches!(err, crate::Error::ConflictingMerge { .. }));
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);

        assert_eq!(Peer::from_name(&store, "Tata").unwrap(), right);
        assert_eq!(store.find_one_key(KeyQuery::Id(k2.id())).unwrap().peer(), right.id());
        assert_eq!(store.find_release(stored.id().unwrap()).unwrap(), Some(stored));
    }
}
