//! Key releases for encrypted mailing lists.
//!
//! A [`Release`] records which keys represent the members ([`Peer`]s) of a
//! [`MailingList`] on a given date, under a [`Policy`]. Releases are derived from their
//! predecessor, checked against their policy and published to the list.
//!
//! Key material never lives here: every question about a key goes to a [`KeyBackend`],
//! and entities are persisted through a [`Store`].

mod backend;
mod config;
pub mod error;
mod id;
mod key;
mod mailinglist;
mod memory;
mod peer;
mod policy;
mod release;
mod store;
mod timestamp;

#[cfg(any(test, feature = "test_utils"))]
pub mod testing;

pub use backend::{Algorithm, KeyBackend, Uid};
pub use config::{Config, ReleaseConfig};
pub use error::{Error, ErrorKind, Result};
pub use id::{Fingerprint, KeyId, MailingListId, PeerId, ReleaseId};
pub use key::{KeyRecord, Signer};
pub use mailinglist::{MailingList, ReleaseSource, DEFAULT_KEY_UPDATE_MSG};
pub use memory::MemoryStore;
pub use peer::{merge_peers, Peer};
pub use policy::{Compliance, Policy, PolicyViolation, ViolationKind};
pub use release::{
    InheritOptions, Member, Publication, PublishOptions, Release, ReleaseDiff,
    ReleaseKeyAssociation, ReleaseSummary, Retention, DEFAULT_RETENTION,
};
pub use store::{expect_one, KeyQuery, ListQuery, PeerQuery, Query, Store};
pub use timestamp::today;
