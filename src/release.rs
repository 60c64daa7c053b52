pub(crate) mod association;
pub(crate) mod diff;
pub(crate) mod publish;

pub use association::ReleaseKeyAssociation;
pub use diff::ReleaseDiff;
pub use publish::{Publication, PublishOptions, ReleaseSummary};

use crate::backend::KeyBackend;
use crate::error::{
    DuplicateAssociationSnafu, DuplicateReleaseSnafu, InconsistentSnafu, MissingPeerSnafu,
    NotInReleaseSnafu, PeerAlreadyActiveSnafu, Result, UnpersistedSnafu,
};
use crate::id::{KeyId, MailingListId, ReleaseId};
use crate::key::KeyRecord;
use crate::peer::Peer;
use crate::policy::{Compliance, Policy};
use crate::store::{KeyQuery, Store};
use crate::timestamp::today;
use jiff::civil::Date;
use snafu::{ensure, OptionExt};
use std::collections::HashSet;
use tracing::{debug, info};

/// How many releases back [`Release::delete_old_inactive_keys`] looks.
pub const DEFAULT_RETENTION: usize = 5;

/// Retention of inactive keys.
///
/// Written as `false` (keep every inactive key), `true` (the default depth) or a depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "RetentionRepr", into = "RetentionRepr")]
pub enum Retention {
    Disabled,
    /// Keep inactive keys that were active this many releases back
    Releases(usize),
}

impl Default for Retention {
    fn default() -> Self {
        Retention::Releases(DEFAULT_RETENTION)
    }
}

impl From<bool> for Retention {
    fn from(value: bool) -> Self {
        if value {
            Retention::default()
        } else {
            Retention::Disabled
        }
    }
}

impl From<usize> for Retention {
    fn from(value: usize) -> Self {
        match value {
            0 => Retention::Disabled,
            depth => Retention::Releases(depth),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
enum RetentionRepr {
    Flag(bool),
    Depth(usize),
}

impl From<RetentionRepr> for Retention {
    fn from(value: RetentionRepr) -> Self {
        match value {
            RetentionRepr::Flag(flag) => flag.into(),
            RetentionRepr::Depth(depth) => depth.into(),
        }
    }
}

impl From<Retention> for RetentionRepr {
    fn from(value: Retention) -> Self {
        match value {
            Retention::Disabled => RetentionRepr::Flag(false),
            Retention::Releases(depth) => RetentionRepr::Depth(depth),
        }
    }
}

/// What [`Release::inherit`] does to the derived release besides copying keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritOptions {
    pub deactivate_invalid: bool,
    pub retention: Retention,
}

impl Default for InheritOptions {
    fn default() -> Self {
        Self {
            deactivate_invalid: true,
            retention: Retention::default(),
        }
    }
}

/// Something a release can contain.
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    Key(&'a KeyRecord),
    Peer(&'a Peer),
}

impl<'a> From<&'a KeyRecord> for Member<'a> {
    fn from(value: &'a KeyRecord) -> Self {
        Member::Key(value)
    }
}

impl<'a> From<&'a Peer> for Member<'a> {
    fn from(value: &'a Peer) -> Self {
        Member::Peer(value)
    }
}

/// The keys in effect for a mailing list on a date, under a policy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Release {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<ReleaseId>,

    mailing_list: MailingListId,

    #[serde(with = "crate::timestamp::required")]
    date: Date,

    policy: Policy,

    #[serde(default)]
    associations: Vec<ReleaseKeyAssociation>,
}

impl Release {
    /// A release with the given active and inactive keys. A key may only appear once.
    pub fn new(
        mailing_list: MailingListId,
        date: Date,
        policy: Policy,
        active_keys: impl IntoIterator<Item = KeyRecord>,
        inactive_keys: impl IntoIterator<Item = KeyRecord>,
    ) -> Result<Self> {
        let mut release = Self {
            id: None,
            mailing_list,
            date,
            policy,
            associations: Vec::new(),
        };
        for key in active_keys {
            release.push(key, true)?;
        }
        for key in inactive_keys {
            release.push(key, false)?;
        }
        Ok(release)
    }

    /// Used by stores to hand out their identifier.
    pub fn with_id(mut self, id: ReleaseId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<ReleaseId> {
        self.id
    }

    pub fn mailing_list(&self) -> MailingListId {
        self.mailing_list
    }

    pub fn date(&self) -> Date {
        self.date
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn associations(&self) -> &[ReleaseKeyAssociation] {
        &self.associations
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyRecord> + '_ {
        self.associations.iter().map(|assoc| &assoc.key)
    }

    pub fn active_keys(&self) -> impl Iterator<Item = &KeyRecord> + '_ {
        self.associations
            .iter()
            .filter(|assoc| assoc.is_active)
            .map(|assoc| &assoc.key)
    }

    pub fn inactive_keys(&self) -> impl Iterator<Item = &KeyRecord> + '_ {
        self.associations
            .iter()
            .filter(|assoc| !assoc.is_active)
            .map(|assoc| &assoc.key)
    }

    fn push(&mut self, key: KeyRecord, active: bool) -> Result<()> {
        ensure!(
            !self.associations.iter().any(|assoc| assoc.key == key),
            DuplicateAssociationSnafu {
                key: key.id(),
                date: self.date
            }
        );
        self.associations
            .push(ReleaseKeyAssociation::new(key, active));
        Ok(())
    }

    /// Drop the association of `key`, if any.
    pub(crate) fn remove_key(&mut self, key: KeyId) -> bool {
        let before = self.associations.len();
        self.associations.retain(|assoc| assoc.key.id() != key);
        self.associations.len() != before
    }

    /// Replace the stored copy of `key`, keeping its association flags.
    pub(crate) fn refresh_key(&mut self, key: &KeyRecord) -> bool {
        match self.associations.iter_mut().find(|assoc| assoc.key == *key) {
            Some(assoc) => {
                assoc.key = key.clone();
                true
            }
            None => false,
        }
    }

    fn association(&self, key: &KeyRecord) -> Result<&ReleaseKeyAssociation> {
        self.associations
            .iter()
            .find(|assoc| assoc.key == *key)
            .context(NotInReleaseSnafu {
                key: key.id(),
                date: self.date,
            })
    }

    fn association_mut(&mut self, key: &KeyRecord) -> Result<&mut ReleaseKeyAssociation> {
        let date = self.date;
        self.associations
            .iter_mut()
            .find(|assoc| assoc.key == *key)
            .context(NotInReleaseSnafu { key: key.id(), date })
    }

    /// Derive the next release of the same mailing list on `date`.
    ///
    /// Active and inactive keys are carried over, under `policy` or this release's policy.
    /// Invalid keys are then deactivated and old inactive keys deleted as `options` ask,
    /// and policy exceptions of keys active here are kept. The derived release is not
    /// inserted into the store.
    pub fn inherit(
        &self,
        backend: &dyn KeyBackend,
        store: &mut dyn Store,
        date: Date,
        policy: Option<Policy>,
        options: InheritOptions,
    ) -> Result<Release> {
        ensure!(
            !store
                .releases(self.mailing_list)?
                .iter()
                .any(|release| release.date == date),
            DuplicateReleaseSnafu {
                list: self.mailing_list,
                date
            }
        );

        let mut release = Release::new(
            self.mailing_list,
            date,
            policy.unwrap_or_else(|| self.policy.clone()),
            self.active_keys().cloned(),
            self.inactive_keys().cloned(),
        )?;

        if options.deactivate_invalid {
            release.deactivate_invalid(backend)?;
        }
        release.delete_old_inactive_keys(store, options.retention)?;

        // keys pruned above lose their exception with their association
        let exceptions: HashSet<KeyId> = self
            .associations
            .iter()
            .filter(|assoc| assoc.is_active && assoc.policy_exception)
            .map(|assoc| assoc.key.id())
            .collect();
        for assoc in &mut release.associations {
            if exceptions.contains(&assoc.key.id()) {
                assoc.policy_exception = true;
            }
        }

        info!(
            list = %self.mailing_list,
            "derived release {date} from {}: {} active, {} inactive keys",
            self.date,
            release.active_keys().count(),
            release.inactive_keys().count()
        );
        Ok(release)
    }

    /// Deactivate every active key that is not okay or lacks the policy CA's signature.
    ///
    /// Policy exceptions do not protect a key here. Returns the deactivated keys.
    pub fn deactivate_invalid(&mut self, backend: &dyn KeyBackend) -> Result<Vec<KeyId>> {
        let mut deactivated = Vec::new();
        for assoc in self.associations.iter_mut().filter(|assoc| assoc.is_active) {
            let reason = if !assoc.key.is_okay(backend)? {
                "not okay"
            } else if !assoc.key.is_signed_by(backend, self.policy.ca())? {
                "not signed by CA"
            } else {
                continue;
            };

            debug!(key = %assoc.key.id(), date = %self.date, "deactivating key: {reason}");
            assoc.is_active = false;
            deactivated.push(assoc.key.id());
        }
        Ok(deactivated)
    }

    /// Delete inactive keys that were not active `retention` releases ago.
    ///
    /// The associations are removed from this release and, if it was stored, from the
    /// store. If fewer releases precede this one, the earliest release is used; with no
    /// preceding release nothing is deleted. Returns the deleted keys.
    pub fn delete_old_inactive_keys(
        &mut self,
        store: &mut dyn Store,
        retention: Retention,
    ) -> Result<Vec<KeyId>> {
        let depth = match retention {
            Retention::Disabled | Retention::Releases(0) => return Ok(Vec::new()),
            Retention::Releases(depth) => depth,
        };
        let Some(old_release) = self.predecessor(&*store, depth)? else {
            debug!(date = %self.date, "no earlier release, keeping inactive keys");
            return Ok(Vec::new());
        };

        let still_relevant: HashSet<KeyId> = old_release.active_keys().map(KeyRecord::id).collect();
        let deleted: Vec<KeyId> = self
            .inactive_keys()
            .map(KeyRecord::id)
            .filter(|id| !still_relevant.contains(id))
            .collect();

        self.associations
            .retain(|assoc| assoc.is_active || !deleted.contains(&assoc.key.id()));
        if let Some(id) = self.id {
            for key in &deleted {
                store.delete_association(id, *key)?;
            }
        }

        if !deleted.is_empty() {
            info!(
                date = %self.date,
                "deleted {} inactive keys not active on {}",
                deleted.len(),
                old_release.date
            );
        }
        Ok(deleted)
    }

    /// The release `n` places before this one among the stored releases of its mailing
    /// list, or the earliest one if there are fewer. `None` without an earlier release.
    pub fn predecessor(&self, store: &dyn Store, n: usize) -> Result<Option<Release>> {
        if n == 0 {
            return Ok(Some(self.clone()));
        }
        let mut earlier: Vec<Release> = store
            .releases(self.mailing_list)?
            .into_iter()
            .filter(|release| release.date < self.date)
            .collect();
        let index = earlier.len().saturating_sub(n);
        if earlier.is_empty() {
            return Ok(None);
        }
        Ok(Some(earlier.swap_remove(index)))
    }

    /// The stored release immediately preceding this one.
    pub fn prev(&self, store: &dyn Store) -> Result<Option<Release>> {
        self.predecessor(store, 1)
    }

    /// Check active keys against the policy, CA signature included.
    ///
    /// Keys with a policy exception are skipped unless `ignore_exceptions` is set.
    pub fn verify(&self, backend: &dyn KeyBackend, ignore_exceptions: bool) -> Result<Compliance> {
        self.verify_at(backend, today(), ignore_exceptions)
    }

    pub fn verify_at(
        &self,
        backend: &dyn KeyBackend,
        today: Date,
        ignore_exceptions: bool,
    ) -> Result<Compliance> {
        let mut compliance = Compliance::passed();
        for assoc in &self.associations {
            if assoc.is_active && (ignore_exceptions || !assoc.policy_exception) {
                compliance.merge(self.policy.check_at(backend, &assoc.key, today, true)?);
            }
        }
        Ok(compliance)
    }

    /// Whether a key, or a key of a peer, is active in this release.
    ///
    /// Both the release and the member must have been stored.
    pub fn contains<'a>(&self, store: &dyn Store, member: impl Into<Member<'a>>) -> Result<bool> {
        ensure!(
            self.id.is_some(),
            UnpersistedSnafu {
                what: format!("release {}", self.date)
            }
        );

        let (what, count) = match member.into() {
            Member::Key(key) => {
                ensure!(
                    !store.find_keys(KeyQuery::Id(key.id()))?.is_empty(),
                    UnpersistedSnafu {
                        what: format!("key {}", key.id())
                    }
                );
                let count = self.active_keys().filter(|k| *k == key).count();
                (format!("key {}", key.id()), count)
            }
            Member::Peer(peer) => {
                let id = peer.id().context(UnpersistedSnafu {
                    what: format!("peer '{}'", peer.name()),
                })?;
                let count = self
                    .active_keys()
                    .filter(|k| k.peer() == Some(id))
                    .count();
                (format!("peer '{}'", peer.name()), count)
            }
        };

        ensure!(count <= 1, InconsistentSnafu { what, date: self.date });
        Ok(count == 1)
    }

    /// Add `key` to this release.
    ///
    /// The key must belong to a peer, and a peer may only have one active key per release.
    /// Active keys are checked against the policy first if `check` is set; violations do
    /// not prevent the key from being added.
    pub fn add_key(
        &mut self,
        backend: &dyn KeyBackend,
        key: KeyRecord,
        active: bool,
        check: bool,
    ) -> Result<Compliance> {
        let peer = key.peer().context(MissingPeerSnafu { key: key.id() })?;
        if active {
            ensure!(
                !self.active_keys().any(|k| k.peer() == Some(peer)),
                PeerAlreadyActiveSnafu {
                    peer,
                    key: key.id(),
                    date: self.date
                }
            );
        }

        let compliance = if check && active {
            self.policy.check(backend, &key, true)?
        } else {
            Compliance::passed()
        };

        self.push(key, active)?;
        Ok(compliance)
    }

    pub fn add_exception(&mut self, key: &KeyRecord) -> Result<()> {
        self.association_mut(key)?.policy_exception = true;
        Ok(())
    }

    pub fn has_exception(&self, key: &KeyRecord) -> Result<bool> {
        Ok(self.association(key)?.policy_exception)
    }

    pub fn is_active(&self, key: &KeyRecord) -> Result<bool> {
        Ok(self.association(key)?.is_active)
    }

    /// Mark `key` inactive from this release on.
    pub fn deactivate(&mut self, key: &KeyRecord) -> Result<()> {
        self.association_mut(key)?.is_active = false;
        Ok(())
    }
}
