use crate::id::{KeyId, PeerId};
use crate::key::KeyRecord;
use crate::Release;
use std::collections::{BTreeSet, HashSet};

/// Membership changes between a release and its predecessor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseDiff {
    /// Keys active now but not before
    pub keys_in: BTreeSet<KeyRecord>,
    /// Keys active before, or newly dropped, and not active now
    pub keys_out: BTreeSet<KeyRecord>,
    pub peers_joined: BTreeSet<PeerId>,
    /// Peers who swapped one key for another
    pub peers_changed: BTreeSet<PeerId>,
    pub peers_left: BTreeSet<PeerId>,
}

impl ReleaseDiff {
    pub fn is_empty(&self) -> bool {
        self.keys_in.is_empty()
            && self.keys_out.is_empty()
            && self.peers_joined.is_empty()
            && self.peers_changed.is_empty()
            && self.peers_left.is_empty()
    }
}

fn peers<'a>(keys: impl IntoIterator<Item = &'a KeyRecord>) -> BTreeSet<PeerId> {
    keys.into_iter().filter_map(KeyRecord::peer).collect()
}

impl Release {
    /// Compare this release with `other`, its predecessor.
    ///
    /// The baseline is every key active in `other` plus every key inactive here that was
    /// not already inactive in `other`. Keys without a peer do not count towards peers.
    pub fn diff(&self, other: &Release) -> ReleaseDiff {
        let already_inactive: HashSet<KeyId> = other.inactive_keys().map(KeyRecord::id).collect();
        let keys_prev: BTreeSet<KeyRecord> = other
            .active_keys()
            .chain(
                self.inactive_keys()
                    .filter(|key| !already_inactive.contains(&key.id())),
            )
            .cloned()
            .collect();
        let keys_curr: BTreeSet<KeyRecord> = self.active_keys().cloned().collect();

        let keys_out: BTreeSet<KeyRecord> = keys_prev.difference(&keys_curr).cloned().collect();
        let keys_in: BTreeSet<KeyRecord> = keys_curr.difference(&keys_prev).cloned().collect();

        let peers_prev = peers(&keys_prev);
        let peers_curr = peers(&keys_curr);
        let peers_in = peers(&keys_in);
        let peers_out = peers(&keys_out);

        ReleaseDiff {
            peers_joined: peers_curr.difference(&peers_prev).copied().collect(),
            peers_changed: peers_in.intersection(&peers_out).copied().collect(),
            peers_left: peers_prev.difference(&peers_curr).copied().collect(),
            keys_in,
            keys_out,
        }
    }
}
