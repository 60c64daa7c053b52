use crate::id::{KeyId, MailingListId, PeerId, ReleaseId};
use crate::store::{
    DuplicateReleaseSnafu, KeyQuery, ListQuery, NotFoundSnafu, PeerQuery, Store, StoreError,
    UnpersistedSnafu,
};
use crate::{KeyRecord, MailingList, Peer, Release};
use snafu::{ensure, OptionExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// A [`Store`] keeping everything in memory, for tests and short-lived tools.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    keys: BTreeMap<KeyId, KeyRecord>,
    peers: BTreeMap<PeerId, Peer>,
    lists: BTreeMap<MailingListId, MailingList>,
    releases: BTreeMap<ReleaseId, Release>,
}

fn next_id<K: Copy, V>(map: &BTreeMap<K, V>, raw: impl Fn(K) -> u64) -> u64 {
    map.keys().next_back().map_or(1, |last| raw(*last) + 1)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn find_keys(&self, query: KeyQuery<'_>) -> Result<Vec<KeyRecord>, StoreError> {
        let keys = self.keys.values().filter(|key| match query {
            KeyQuery::Id(id) => key.id() == id,
            KeyQuery::Name(name) => key.name() == name,
            KeyQuery::Email(email) => key.email() == email,
            KeyQuery::Peer(peer) => key.peer() == Some(peer),
        });
        Ok(keys.cloned().collect())
    }

    fn find_peers(&self, query: PeerQuery<'_>) -> Result<Vec<Peer>, StoreError> {
        let peers = match query {
            PeerQuery::Id(id) => self.peers.get(&id).cloned().into_iter().collect(),
            PeerQuery::Name(name) => self
                .peers
                .values()
                .filter(|peer| peer.name() == name)
                .cloned()
                .collect(),
            PeerQuery::Email(email) => {
                let owners: BTreeSet<PeerId> = self
                    .keys
                    .values()
                    .filter(|key| key.email() == email)
                    .filter_map(KeyRecord::peer)
                    .collect();
                owners
                    .iter()
                    .filter_map(|id| self.peers.get(id))
                    .cloned()
                    .collect()
            }
        };
        Ok(peers)
    }

    fn find_mailing_lists(&self, query: ListQuery<'_>) -> Result<Vec<MailingList>, StoreError> {
        let lists = self.lists.values().filter(|list| match query {
            ListQuery::Id(id) => list.id() == Some(id),
            ListQuery::Name(name) => list.name() == name,
        });
        Ok(lists.cloned().collect())
    }

    fn releases(&self, list: MailingListId) -> Result<Vec<Release>, StoreError> {
        let mut releases: Vec<Release> = self
            .releases
            .values()
            .filter(|release| release.mailing_list() == list)
            .cloned()
            .collect();
        releases.sort_by_key(Release::date);
        Ok(releases)
    }

    fn find_release(&self, id: ReleaseId) -> Result<Option<Release>, StoreError> {
        Ok(self.releases.get(&id).cloned())
    }

    fn releases_with_key(&self, key: KeyId) -> Result<Vec<Release>, StoreError> {
        let releases = self
            .releases
            .values()
            .filter(|release| release.keys().any(|k| k.id() == key));
        Ok(releases.cloned().collect())
    }

    fn save_key(&mut self, key: KeyRecord) -> Result<(), StoreError> {
        trace!(key = %key.id(), "saving key");
        self.keys.insert(key.id(), key);
        Ok(())
    }

    fn save_peer(&mut self, peer: Peer) -> Result<Peer, StoreError> {
        let peer = match peer.id() {
            Some(_) => peer,
            None => peer.with_id(PeerId(next_id(&self.peers, |id| id.0))),
        };
        let id = peer.id().context(UnpersistedSnafu { entity: "peer" })?;
        self.peers.insert(id, peer.clone());
        Ok(peer)
    }

    fn delete_peer(&mut self, id: PeerId) -> Result<bool, StoreError> {
        Ok(self.peers.remove(&id).is_some())
    }

    fn save_mailing_list(&mut self, list: MailingList) -> Result<MailingList, StoreError> {
        let list = match list.id() {
            Some(_) => list,
            None => list.with_id(MailingListId(next_id(&self.lists, |id| id.0))),
        };
        let id = list.id().context(UnpersistedSnafu {
            entity: "mailing list",
        })?;
        self.lists.insert(id, list.clone());
        Ok(list)
    }

    fn insert_release(&mut self, release: Release) -> Result<Release, StoreError> {
        let (list, date) = (release.mailing_list(), release.date());
        ensure!(
            !self
                .releases
                .values()
                .any(|other| other.mailing_list() == list && other.date() == date),
            DuplicateReleaseSnafu { list, date }
        );

        let release = release.with_id(ReleaseId(next_id(&self.releases, |id| id.0)));
        let id = release.id().context(UnpersistedSnafu { entity: "release" })?;
        trace!(%list, %date, %id, "inserting release");
        self.releases.insert(id, release.clone());
        Ok(release)
    }

    fn save_release(&mut self, release: &Release) -> Result<(), StoreError> {
        let id = release.id().context(UnpersistedSnafu { entity: "release" })?;
        let stored = self.releases.get_mut(&id).context(NotFoundSnafu {
            entity: "release",
            query: format!("id {id}"),
        })?;
        *stored = release.clone();
        Ok(())
    }

    fn delete_release(&mut self, id: ReleaseId) -> Result<bool, StoreError> {
        Ok(self.releases.remove(&id).is_some())
    }

    fn delete_association(&mut self, release: ReleaseId, key: KeyId) -> Result<bool, StoreError> {
        Ok(self
            .releases
            .get_mut(&release)
            .is_some_and(|release| release.remove_key(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::Policy;
    use jiff::civil::date;
    use jiff::Timestamp;

    fn key(id: u64, name: &str, email: &str, peer: PeerId) -> KeyRecord {
        KeyRecord::new(KeyId::new(id), name, email, Timestamp::UNIX_EPOCH).with_peer(peer)
    }

    fn release(list: MailingListId, day: jiff::civil::Date, keys: &[&KeyRecord]) -> Release {
        let ca = KeyRecord::new(KeyId::new(0xca), "CA", "ca@example.org", Timestamp::UNIX_EPOCH);
        Release::new(
            list,
            day,
            Policy::new("test", date(2020, 1, 1), ca, 0, 0, []),
            keys.iter().map(|k| (*k).clone()),
            [],
        )
        .unwrap()
    }

    #[test]
    fn ids_are_assigned_once() {
        let mut store = MemoryStore::new();
        let toto = store.save_peer(Peer::new("Toto")).unwrap();
        let tata = store.save_peer(Peer::new("Tata")).unwrap();
        assert_eq!(toto.id(), Some(PeerId(1)));
        assert_eq!(tata.id(), Some(PeerId(2)));

        let renamed = store
            .save_peer(Peer::new("Toto Jr").with_id(PeerId(1)))
            .unwrap();
        assert_eq!(renamed.id(), Some(PeerId(1)));
        assert_eq!(store.find_peers(PeerQuery::Name("Toto")).unwrap(), vec![]);

        let explicit = store.save_peer(Peer::new("Titi").with_id(PeerId(10))).unwrap();
        assert_eq!(explicit.id(), Some(PeerId(10)));
        assert_eq!(store.save_peer(Peer::new("Tutu")).unwrap().id(), Some(PeerId(11)));
    }

    #[test]
    fn peers_by_key_email() {
        let mut store = MemoryStore::new();
        let toto = store.save_peer(Peer::new("Toto")).unwrap();
        let id = toto.id().unwrap();
        store.save_key(key(1, "Toto", "toto@example.org", id)).unwrap();
        store.save_key(key(2, "Toto", "toto@example.org", id)).unwrap();

        let peers = store.find_peers(PeerQuery::Email("toto@example.org")).unwrap();
        assert_eq!(peers, vec![toto]);
        assert_eq!(store.find_keys(KeyQuery::Peer(id)).unwrap().len(), 2);
        assert!(store.find_peers(PeerQuery::Email("nobody@example.org")).unwrap().is_empty());
    }

    #[test]
    fn releases_ordered_and_unique_by_date() {
        let mut store = MemoryStore::new();
        let list = MailingListId(1);
        let k1 = key(1, "Toto", "toto@example.org", PeerId(1));

        store.insert_release(release(list, date(2020, 3, 1), &[&k1])).unwrap();
        store.insert_release(release(list, date(2020, 1, 1), &[&k1])).unwrap();
        store.insert_release(release(MailingListId(2), date(2020, 1, 1), &[])).unwrap();

        let dates: Vec<_> = store.releases(list).unwrap().iter().map(Release::date).collect();
        assert_eq!(dates, vec![date(2020, 1, 1), date(2020, 3, 1)]);

        let err = store
            .insert_release(release(list, date(2020, 1, 1), &[]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[test]
    fn association_deletion() {
        let mut store = MemoryStore::new();
        let k1 = key(1, "Toto", "toto@example.org", PeerId(1));
        let stored = store
            .insert_release(release(MailingListId(1), date(2020, 1, 1), &[&k1]))
            .unwrap();
        let id = stored.id().unwrap();

        assert!(store.delete_association(id, k1.id()).unwrap());
        assert!(!store.delete_association(id, k1.id()).unwrap());
        assert!(!store.delete_association(ReleaseId(42), k1.id()).unwrap());
        assert_eq!(store.find_release(id).unwrap().unwrap().keys().count(), 0);
    }

    #[test]
    fn save_release_needs_insert() {
        let mut store = MemoryStore::new();
        let draft = release(MailingListId(1), date(2020, 1, 1), &[]);
        let err = store.save_release(&draft).unwrap_err();
        assert!(matches!(err, StoreError::Unpersisted { .. }));

        let err = store.save_release(&draft.with_id(ReleaseId(3))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
