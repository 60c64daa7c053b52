use crate::backend::KeyBackend;
use crate::error::{ForeignReleaseSnafu, Result, UnpersistedSnafu};
use crate::id::{KeyId, PeerId};
use crate::key::KeyRecord;
use crate::mailinglist::MailingList;
use crate::peer::Peer;
use crate::policy::Compliance;
use crate::store::{PeerQuery, Store};
use crate::timestamp::utc_date;
use crate::Release;
use base64ct::Encoding;
use jiff::civil::Date;
use snafu::{ensure, OptionExt};
use std::collections::BTreeSet;
use std::fmt;
use tracing::info;

/// How [`Release::publish`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Verify the release against its policy before publishing
    pub check: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { check: true }
    }
}

/// Everything needed to announce a release to its mailing list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Publication {
    /// Announcement text, rendered from the mailing list's key update template
    pub message: String,
    /// Exported key bundle, base64
    pub keys: String,
    /// Outcome of the policy verification, passed if it was skipped
    pub compliance: Compliance,
}

impl Publication {
    pub fn key_bundle(&self) -> Result<Vec<u8>, base64ct::Error> {
        base64ct::Base64::decode_vec(&self.keys)
    }
}

/// Key counts of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub date: Date,
    pub mailing_list: String,
    pub policy_date: Date,
    pub active: usize,
    pub inactive: usize,
    /// Inactive keys that expired before the release date
    pub expired: usize,
    /// Inactive keys without a signature of the policy CA
    pub not_signed: usize,
}

impl fmt::Display for ReleaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "date: {:>10}, list: {:>10}, policy date: {:>10}, active keys: {:3}, inactive keys: {:2} (expired: {:2}, not signed: {:2}), total keys: {:3}",
            self.date.to_string(),
            self.mailing_list,
            self.policy_date.to_string(),
            self.active,
            self.inactive,
            self.expired,
            self.not_signed,
            self.active + self.inactive
        )
    }
}

/// Substitute `{name}` placeholders in a single pass. Unknown placeholders are kept.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut message = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        message.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let value = tail.find('}').and_then(|end| {
            values
                .iter()
                .find(|(name, _)| *name == &tail[..end])
                .map(|(_, value)| (*value, end))
        });
        match value {
            Some((value, end)) => {
                message.push_str(value);
                rest = &tail[end + 1..];
            }
            None => {
                message.push('{');
                rest = tail;
            }
        }
    }
    message.push_str(rest);
    message
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Numbered roster entries, each key followed by its owner.
fn entries<'a>(store: &dyn Store, keys: impl IntoIterator<Item = &'a KeyRecord>) -> Result<String> {
    let mut lines = Vec::new();
    for (i, key) in keys.into_iter().enumerate() {
        let peer = Peer::from_key(store, key)?;
        lines.push(format!("  {:3}. {key}", i + 1));
        lines.push(format!("       {peer}"));
    }
    Ok(lines.join("\n"))
}

fn peer_names(store: &dyn Store, peers: &BTreeSet<PeerId>) -> Result<String> {
    let names = peers
        .iter()
        .map(|id| -> Result<String> {
            Ok(store.find_one_peer(PeerQuery::Id(*id))?.name().to_string())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(names.join(", "))
}

fn by_name<'a>(keys: impl Iterator<Item = &'a KeyRecord>) -> Vec<&'a KeyRecord> {
    let mut keys: Vec<&KeyRecord> = keys.collect();
    keys.sort_by_key(|key| key.name().to_lowercase());
    keys
}

impl Release {
    /// Owners of the active keys, ordered by key name.
    pub fn peers(&self, store: &dyn Store) -> Result<Vec<Peer>> {
        by_name(self.active_keys())
            .into_iter()
            .map(|key| Peer::from_key(store, key))
            .collect()
    }

    /// Exported key material of every key in this release, inactive ones included.
    pub fn dump_keys(&self, backend: &dyn KeyBackend) -> Result<Vec<u8>> {
        let ids: Vec<KeyId> = self.keys().map(KeyRecord::id).collect();
        Ok(backend.export(&ids)?)
    }

    /// Per-recipient rule list telling mail clients which keys to encrypt to for the list.
    pub fn rule_list(&self, list: &MailingList) -> String {
        let ids: Vec<String> = self.active_keys().map(|key| key.id().to_string()).collect();
        format!(
            "<?xml version=\"1.0\" ?>\n  <pgpRuleList>\n    <pgpRule email=\"{{{}}}\" encrypt=\"2\" keyId=\"{}\" negateRule=\"0\" pgpMime=\"2\" sign=\"2\"/>\n  </pgpRuleList>\n",
            escape_xml(list.email()),
            ids.join(", ")
        )
    }

    pub fn summary(&self, backend: &dyn KeyBackend, list: &MailingList) -> Result<ReleaseSummary> {
        let mut expired = 0;
        let mut not_signed = 0;
        for key in self.inactive_keys() {
            if !key.is_signed_by(backend, self.policy().ca())? {
                not_signed += 1;
                continue;
            }
            if let Some(expires) = key.expires_at(backend)? {
                if utc_date(expires) < self.date() {
                    expired += 1;
                }
            }
        }

        Ok(ReleaseSummary {
            date: self.date(),
            mailing_list: list.name().to_string(),
            policy_date: self.policy().implementation_date(),
            active: self.active_keys().count(),
            inactive: self.inactive_keys().count(),
            expired,
            not_signed,
        })
    }

    /// Announcement and key bundle for this release.
    ///
    /// The membership changes are computed against `previous`, or against the stored
    /// predecessor if none is given; without either they are left empty.
    pub fn publish(
        &self,
        backend: &dyn KeyBackend,
        store: &dyn Store,
        list: &MailingList,
        previous: Option<&Release>,
        options: PublishOptions,
    ) -> Result<Publication> {
        let list_id = list.id().context(UnpersistedSnafu {
            what: format!("mailing list '{}'", list.name()),
        })?;
        ensure!(
            list_id == self.mailing_list(),
            ForeignReleaseSnafu {
                list: list_id,
                release_list: self.mailing_list()
            }
        );

        let compliance = if options.check {
            self.verify(backend, false)?
        } else {
            Compliance::passed()
        };

        let keys = entries(store, by_name(self.active_keys()))?;

        let previous = match previous {
            Some(previous) => Some(previous.clone()),
            None => self.prev(store)?,
        };
        let (keys_in, keys_out, peers_in, peers_changed, peers_out) = match previous {
            Some(previous) => {
                let diff = self.diff(&previous);
                (
                    entries(store, &diff.keys_in)?,
                    entries(store, &diff.keys_out)?,
                    peer_names(store, &diff.peers_joined)?,
                    peer_names(store, &diff.peers_changed)?,
                    peer_names(store, &diff.peers_left)?,
                )
            }
            None => Default::default(),
        };

        let message = render(
            list.key_update_msg(),
            &[
                ("mailinglist", list.name()),
                ("keys", &keys),
                ("keys_in", &keys_in),
                ("keys_out", &keys_out),
                ("peers_in", &peers_in),
                ("peers_changed", &peers_changed),
                ("peers_out", &peers_out),
            ],
        );
        let bundle = self.dump_keys(backend)?;

        info!(
            list = %list.name(),
            date = %self.date(),
            violations = compliance.violations().len(),
            "published release with {} active keys",
            self.active_keys().count()
        );
        Ok(Publication {
            message,
            keys: base64ct::Base64::encode_string(&bundle),
            compliance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_every_placeholder() {
        let message = render(
            "{mailinglist}: {keys}\nnew: {peers_in} {peers_in}\n{unknown}",
            &[("mailinglist", "toto"), ("keys", "3 keys"), ("peers_in", "Phil")],
        );
        assert_eq!(message, "toto: 3 keys\nnew: Phil Phil\n{unknown}");
    }

    #[test]
    fn render_leaves_inserted_values_alone() {
        let message = render(
            "{keys}|{peers_in}|{{keys}",
            &[("keys", "Bob {peers_in}"), ("peers_in", "Phil")],
        );
        assert_eq!(message, "Bob {peers_in}|Phil|{Bob {peers_in}");
    }

    #[test]
    fn escape_attribute() {
        assert_eq!(escape_xml(r#"a&b"<c>"#), "a&amp;b&quot;&lt;c&gt;");
    }

    #[test]
    fn summary_line() {
        let summary = ReleaseSummary {
            date: jiff::civil::date(2020, 2, 1),
            mailing_list: "toto".into(),
            policy_date: jiff::civil::date(2020, 1, 1),
            active: 12,
            inactive: 3,
            expired: 1,
            not_signed: 2,
        };
        assert_eq!(
            summary.to_string(),
            "date: 2020-02-01, list:       toto, policy date: 2020-01-01, active keys:  12, inactive keys:  3 (expired:  1, not signed:  2), total keys:  15"
        );
    }
}
