use crate::backend::KeyBackend;
use crate::error::{
    DuplicateReleaseSnafu, ForeignReleaseSnafu, MissingPolicySnafu, NoReleaseSnafu, Result,
    UnpersistedSnafu,
};
use crate::id::{KeyId, MailingListId};
use crate::key::KeyRecord;
use crate::policy::Policy;
use crate::release::{InheritOptions, Member, Release};
use crate::store::{ListQuery, Store};
use crate::timestamp::today;
use jiff::civil::Date;
use snafu::{ensure, OptionExt};
use std::collections::HashSet;
use std::fmt;
use tracing::info;

/// Announcement sent with every release unless the list has its own.
pub const DEFAULT_KEY_UPDATE_MSG: &str = "\
Hello {mailinglist},

this is the key update for the list.

Keys joining:
{keys_in}

Keys leaving:
{keys_out}

New peers: {peers_in}
Peers with a new key: {peers_changed}
Peers leaving: {peers_out}

Current keys:
{keys}
";

/// A mailing list whose members exchange encrypted mail, and whose keys are released
/// under a policy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MailingList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<MailingListId>,
    name: String,
    email: String,

    /// Policy of releases started from scratch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    policy: Option<Policy>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,

    /// Sent to a peer joining the list
    #[serde(default, skip_serializing_if = "String::is_empty")]
    new_member_msg: String,

    /// Template for [`Release::publish`](crate::Release::publish)
    #[serde(default = "default_key_update_msg")]
    key_update_msg: String,
}

fn default_key_update_msg() -> String {
    DEFAULT_KEY_UPDATE_MSG.to_string()
}

/// Where [`MailingList::new_release`] takes its keys from.
#[derive(Debug, Clone, Copy)]
pub enum ReleaseSource<'a> {
    /// Inherit from the latest release of the list
    Current,
    /// Inherit from this release, which must belong to the list
    From(&'a Release),
    /// Start without keys, under the list's policy
    Empty,
}

impl MailingList {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            email: email.into(),
            policy: None,
            description: String::new(),
            new_member_msg: String::new(),
            key_update_msg: default_key_update_msg(),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_new_member_msg(mut self, msg: impl Into<String>) -> Self {
        self.new_member_msg = msg.into();
        self
    }

    pub fn with_key_update_msg(mut self, msg: impl Into<String>) -> Self {
        self.key_update_msg = msg.into();
        self
    }

    /// Used by stores to hand out their identifier.
    pub fn with_id(mut self, id: MailingListId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<MailingListId> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.policy.as_ref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn new_member_msg(&self) -> &str {
        &self.new_member_msg
    }

    pub fn key_update_msg(&self) -> &str {
        &self.key_update_msg
    }

    /// A mailing list with this name, the first one if there are several.
    pub fn from_name(store: &dyn Store, name: &str) -> Result<Self> {
        Ok(store.find_one_mailing_list(ListQuery::Name(name))?)
    }

    /// Releases of this list, earliest first.
    pub fn releases(&self, store: &dyn Store) -> Result<Vec<Release>> {
        Ok(store.releases(self.persisted_id()?)?)
    }

    /// The latest release of this list.
    pub fn current_release(&self, store: &dyn Store) -> Result<Release> {
        self.releases(store)?.pop().context(NoReleaseSnafu {
            list: self.name.clone(),
        })
    }

    /// Build the next release of this list on `date`, today if not given.
    ///
    /// The release is returned without being inserted into the store.
    pub fn new_release(
        &self,
        backend: &dyn KeyBackend,
        store: &mut dyn Store,
        date: Option<Date>,
        source: ReleaseSource<'_>,
        options: InheritOptions,
    ) -> Result<Release> {
        let id = self.persisted_id()?;
        let date = date.unwrap_or_else(today);

        let release = match source {
            ReleaseSource::Current => {
                let current = self.current_release(&*store)?;
                current.inherit(backend, store, date, None, options)?
            }
            ReleaseSource::From(release) => {
                ensure!(
                    release.mailing_list() == id,
                    ForeignReleaseSnafu {
                        list: id,
                        release_list: release.mailing_list()
                    }
                );
                release.inherit(backend, store, date, None, options)?
            }
            ReleaseSource::Empty => {
                ensure!(
                    !store.releases(id)?.iter().any(|r| r.date() == date),
                    DuplicateReleaseSnafu { list: id, date }
                );
                let policy = self.policy.clone().context(MissingPolicySnafu {
                    list: self.name.clone(),
                })?;
                Release::new(id, date, policy, [], [])?
            }
        };

        info!(list = %self.name, %date, "new release with {} keys", release.keys().count());
        Ok(release)
    }

    /// Whether a key, or any key of a peer, was ever part of a release of this list,
    /// active or not.
    pub fn ever_contained<'a>(
        &self,
        store: &dyn Store,
        member: impl Into<Member<'a>>,
    ) -> Result<bool> {
        let wanted: HashSet<KeyId> = match member.into() {
            Member::Key(key) => HashSet::from([key.id()]),
            Member::Peer(peer) => peer.keys(store)?.iter().map(KeyRecord::id).collect(),
        };
        Ok(self
            .releases(store)?
            .iter()
            .any(|release| release.keys().any(|key| wanted.contains(&key.id()))))
    }

    fn persisted_id(&self) -> Result<MailingListId> {
        self.id.context(UnpersistedSnafu {
            what: format!("mailing list '{}'", self.name),
        })
    }
}

impl fmt::Display for MailingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
