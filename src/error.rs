use crate::id::{KeyId, MailingListId, PeerId};
use jiff::civil::Date;
use snafu::Snafu;

pub use crate::backend::{BackendError, UnknownAlgorithm};
pub use crate::config::ConfigError;
pub use crate::id::IdError;
pub use crate::store::StoreError;
pub use crate::timestamp::DateError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("store lookup failed"))]
    Store { source: StoreError },

    #[snafu(display("key backend failed"))]
    Backend { source: BackendError },

    #[snafu(display("invalid key id"))]
    Id { source: IdError },

    #[snafu(display("invalid date"))]
    Date { source: DateError },

    #[snafu(display(
        "key {id} does not exist in the key backend and not enough information was provided to build it without"
    ))]
    IncompleteKey { id: KeyId },

    #[snafu(display("key {key} has no peer associated"))]
    MissingPeer { key: KeyId },

    #[snafu(display("mailing list `{list}` has no policy to build a release with"))]
    MissingPolicy { list: String },

    #[snafu(display("no key found in imported data"))]
    NothingImported,

    #[snafu(display("mailing list `{list}` has no release yet"))]
    NoRelease { list: String },

    #[snafu(display("peer {peer} associated with key {key} already has an active key in release {date}"))]
    PeerAlreadyActive { peer: PeerId, key: KeyId, date: Date },

    #[snafu(display("peers {left} and {right} both have an active key in release {date}, merging them would break that release"))]
    ConflictingMerge {
        left: PeerId,
        right: PeerId,
        date: Date,
    },

    #[snafu(display("key {key} is already part of release {date}"))]
    DuplicateAssociation { key: KeyId, date: Date },

    #[snafu(display("key {key} is not in release {date}"))]
    NotInRelease { key: KeyId, date: Date },

    #[snafu(display("mailing list {list} already has a release on {date}"))]
    DuplicateRelease { list: MailingListId, date: Date },

    #[snafu(display("release belongs to mailing list {release_list}, not {list}"))]
    ForeignRelease {
        list: MailingListId,
        release_list: MailingListId,
    },

    #[snafu(display("{what} was not committed to the store yet, cannot issue queries involving its id"))]
    Unpersisted { what: String },

    #[snafu(display("{what} is associated with release {date} more than once, the store is in an inconsistent state"))]
    Inconsistent { what: String, date: Date },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A lookup matched nothing.
    NotFound,
    /// A lookup expected to be unique matched several rows.
    AmbiguousMatch,
    /// Not enough or malformed data to build an entity.
    InvalidConstruction,
    /// An operation would break, or found broken, a release invariant.
    InvariantViolation,
    /// The key backend failed.
    Backend,
    /// The store failed for reasons of its own.
    Store,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Store { source } => source.kind(),
            Error::Backend { .. } => ErrorKind::Backend,
            Error::Id { .. }
            | Error::Date { .. }
            | Error::IncompleteKey { .. }
            | Error::MissingPeer { .. }
            | Error::MissingPolicy { .. } => ErrorKind::InvalidConstruction,
            Error::NothingImported | Error::NoRelease { .. } => ErrorKind::NotFound,
            Error::PeerAlreadyActive { .. }
            | Error::ConflictingMerge { .. }
            | Error::DuplicateAssociation { .. }
            | Error::NotInRelease { .. }
            | Error::DuplicateRelease { .. }
            | Error::ForeignRelease { .. }
            | Error::Unpersisted { .. }
            | Error::Inconsistent { .. } => ErrorKind::InvariantViolation,
        }
    }
}

impl From<StoreError> for Error {
    fn from(source: StoreError) -> Self {
        Error::Store { source }
    }
}

impl From<BackendError> for Error {
    fn from(source: BackendError) -> Self {
        Error::Backend { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_kind() {
        let err = Error::from(StoreError::NotFound {
            entity: "key",
            query: "id 0x0000000000000001".into(),
        });
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::from(StoreError::Ambiguous {
            entity: "key",
            query: "id 0x0000000000000001".into(),
            count: 2,
        });
        assert_eq!(err.kind(), ErrorKind::AmbiguousMatch);
    }

    #[test]
    fn invariant_errors() {
        let err = Error::PeerAlreadyActive {
            peer: PeerId(1),
            key: KeyId::new(2),
            date: jiff::civil::date(2020, 1, 1),
        };
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert_eq!(
            err.to_string(),
            "peer 1 associated with key 0x0000000000000002 already has an active key in release 2020-01-01"
        );
        assert_eq!(
            Error::MissingPeer { key: KeyId::new(2) }.kind(),
            ErrorKind::InvalidConstruction
        );
    }
}
