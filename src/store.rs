use crate::error::ErrorKind;
use crate::id::{KeyId, MailingListId, PeerId, ReleaseId};
use crate::{KeyRecord, MailingList, Peer, Release};
use jiff::civil::Date;
use snafu::Snafu;
use std::fmt;
use tracing::warn;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("no {entity} with {query} in store"))]
    NotFound { entity: &'static str, query: String },

    #[snafu(display("{count} entries of {entity} with {query} in store, expected at most one"))]
    Ambiguous {
        entity: &'static str,
        query: String,
        count: usize,
    },

    #[snafu(display("mailing list {list} already has a release on {date}"))]
    DuplicateRelease { list: MailingListId, date: Date },

    #[snafu(display("{entity} was not inserted into the store yet"))]
    Unpersisted { entity: &'static str },

    #[snafu(display("store failure: {message}"))]
    Backend { message: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Ambiguous { .. } => ErrorKind::AmbiguousMatch,
            StoreError::DuplicateRelease { .. } | StoreError::Unpersisted { .. } => {
                ErrorKind::InvariantViolation
            }
            StoreError::Backend { .. } => ErrorKind::Store,
        }
    }
}

/// Lookup of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyQuery<'a> {
    Id(KeyId),
    Name(&'a str),
    Email(&'a str),
    /// All keys owned by a peer.
    Peer(PeerId),
}

/// Lookup of peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerQuery<'a> {
    Id(PeerId),
    Name(&'a str),
    /// Peers owning at least one key for this address.
    Email(&'a str),
}

/// Lookup of mailing lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListQuery<'a> {
    Id(MailingListId),
    Name(&'a str),
}

/// Whether a query may legitimately match more than one entry.
pub trait Query: fmt::Display {
    fn is_unique(&self) -> bool;
}

impl Query for KeyQuery<'_> {
    fn is_unique(&self) -> bool {
        matches!(self, KeyQuery::Id(_))
    }
}

impl Query for PeerQuery<'_> {
    fn is_unique(&self) -> bool {
        matches!(self, PeerQuery::Id(_))
    }
}

impl Query for ListQuery<'_> {
    fn is_unique(&self) -> bool {
        matches!(self, ListQuery::Id(_))
    }
}

impl fmt::Display for KeyQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyQuery::Id(id) => write!(f, "key id '{id}'"),
            KeyQuery::Name(name) => write!(f, "name '{name}'"),
            KeyQuery::Email(email) => write!(f, "email '{email}'"),
            KeyQuery::Peer(peer) => write!(f, "peer {peer}"),
        }
    }
}

impl fmt::Display for PeerQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerQuery::Id(id) => write!(f, "id {id}"),
            PeerQuery::Name(name) => write!(f, "name '{name}'"),
            PeerQuery::Email(email) => write!(f, "email '{email}'"),
        }
    }
}

impl fmt::Display for ListQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListQuery::Id(id) => write!(f, "id {id}"),
            ListQuery::Name(name) => write!(f, "name '{name}'"),
        }
    }
}

/// Pick the single entry a lookup is expected to return.
///
/// Nothing found is always an error. Several entries for a unique query mean the store
/// broke a uniqueness invariant and are an error too; for other queries the first entry
/// is returned and a warning is logged. "First" has no particular meaning and may differ
/// between two runs.
pub fn expect_one<T>(
    entity: &'static str,
    query: &impl Query,
    mut rows: Vec<T>,
) -> Result<T, StoreError> {
    match rows.len() {
        0 => NotFoundSnafu {
            entity,
            query: query.to_string(),
        }
        .fail(),
        1 => Ok(rows.remove(0)),
        count if query.is_unique() => AmbiguousSnafu {
            entity,
            query: query.to_string(),
            count,
        }
        .fail(),
        count => {
            warn!("{count} entries of {entity} with {query} found, picking first one");
            Ok(rows.remove(0))
        }
    }
}

/// Persistence of keys, peers, mailing lists and releases.
///
/// Releases are stored together with their key associations. Implementations must keep
/// the releases of a mailing list unique by date.
pub trait Store {
    fn find_keys(&self, query: KeyQuery<'_>) -> Result<Vec<KeyRecord>, StoreError>;

    fn find_peers(&self, query: PeerQuery<'_>) -> Result<Vec<Peer>, StoreError>;

    fn find_mailing_lists(&self, query: ListQuery<'_>) -> Result<Vec<MailingList>, StoreError>;

    /// Releases of `list`, earliest first.
    fn releases(&self, list: MailingListId) -> Result<Vec<Release>, StoreError>;

    fn find_release(&self, id: ReleaseId) -> Result<Option<Release>, StoreError>;

    /// Releases of any mailing list with an association to `key`.
    fn releases_with_key(&self, key: KeyId) -> Result<Vec<Release>, StoreError>;

    /// Insert `key` or replace the stored key with the same id.
    fn save_key(&mut self, key: KeyRecord) -> Result<(), StoreError>;

    /// Insert `peer`, assigning it an id if it has none, or replace the stored peer.
    fn save_peer(&mut self, peer: Peer) -> Result<Peer, StoreError>;

    fn delete_peer(&mut self, id: PeerId) -> Result<bool, StoreError>;

    /// Insert `list`, assigning it an id if it has none, or replace the stored list.
    fn save_mailing_list(&mut self, list: MailingList) -> Result<MailingList, StoreError>;

    /// Insert a new release, failing if its mailing list already has a release on that date.
    fn insert_release(&mut self, release: Release) -> Result<Release, StoreError>;

    /// Replace the stored state of an already inserted release.
    fn save_release(&mut self, release: &Release) -> Result<(), StoreError>;

    /// Delete a release together with its key associations.
    fn delete_release(&mut self, id: ReleaseId) -> Result<bool, StoreError>;

    /// Delete the association of `key` with `release`.
    ///
    /// Returns `true` when the removal occurred and `false` when there was no such
    /// association.
    fn delete_association(&mut self, release: ReleaseId, key: KeyId) -> Result<bool, StoreError>;

    fn find_one_key(&self, query: KeyQuery<'_>) -> Result<KeyRecord, StoreError> {
        expect_one("key", &query, self.find_keys(query)?)
    }

    fn find_one_peer(&self, query: PeerQuery<'_>) -> Result<Peer, StoreError> {
        expect_one("peer", &query, self.find_peers(query)?)
    }

    fn find_one_mailing_list(&self, query: ListQuery<'_>) -> Result<MailingList, StoreError> {
        expect_one("mailing list", &query, self.find_mailing_lists(query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn nothing_found() {
        let err = expect_one::<u8>("key", &KeyQuery::Name("Toto"), vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "no key with name 'Toto' in store");
    }

    #[test]
    fn several_for_unique_query() {
        let query = KeyQuery::Id(KeyId::new(1));
        let err = expect_one("key", &query, vec![1, 2]).unwrap_err();
        assert!(matches!(err, StoreError::Ambiguous { count: 2, .. }));
    }

    #[test]
    #[traced_test]
    fn several_for_non_unique_query() {
        let query = PeerQuery::Email("toto@example.org");
        assert_eq!(expect_one("peer", &query, vec![1, 2, 3]).unwrap(), 1);
        assert!(logs_contain("3 entries of peer with email 'toto@example.org' found"));
    }
}
