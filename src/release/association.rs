use crate::key::KeyRecord;

/// Membership of one key in one release.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReleaseKeyAssociation {
    pub(crate) key: KeyRecord,
    pub(crate) is_active: bool,
    /// Exempts the key from [`Release::verify`](crate::Release::verify)
    pub(crate) policy_exception: bool,
}

impl ReleaseKeyAssociation {
    pub fn new(key: KeyRecord, is_active: bool) -> Self {
        Self {
            key,
            is_active,
            policy_exception: false,
        }
    }

    pub fn key(&self) -> &KeyRecord {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn policy_exception(&self) -> bool {
        self.policy_exception
    }
}
