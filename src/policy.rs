use crate::backend::{Algorithm, KeyBackend};
use crate::error::{DateSnafu, Result};
use crate::id::KeyId;
use crate::key::KeyRecord;
use crate::timestamp::{add_days, today, utc_date};
use jiff::civil::Date;
use snafu::ResultExt;
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Rules keys must follow to stay active in a release.
///
/// A policy never changes once created, releases published under it must stay auditable.
/// New rules mean a new policy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Policy {
    name: String,

    #[serde(with = "crate::timestamp::required")]
    implementation_date: Date,

    /// Key whose signature member keys must carry
    ca: KeyRecord,

    /// Minimum key length in bits
    key_len: u32,

    /// Maximum key lifespan in days, zero or less when keys need not expire
    key_lifespan: i64,

    /// Allowed algorithms, empty when any algorithm is allowed
    #[serde(default)]
    algorithms: BTreeSet<Algorithm>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
}

/// What a key violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ViolationKind {
    KeyLength,
    Algorithm,
    Expiration,
    CaSignature,
}

/// A key failing one policy rule. Not an error: callers decide what to make of it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PolicyViolation {
    pub key: KeyId,
    pub kind: ViolationKind,
    pub message: String,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of policy checks: passed when no violation was found.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[must_use]
pub struct Compliance {
    violations: Vec<PolicyViolation>,
}

impl Compliance {
    pub fn passed() -> Self {
        Self::default()
    }

    fn violated(key: &KeyRecord, kind: ViolationKind, message: String) -> Self {
        warn!(key = %key.id(), ?kind, "policy violation: {message}");
        Self {
            violations: vec![PolicyViolation {
                key: key.id(),
                kind,
                message,
            }],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[PolicyViolation] {
        &self.violations
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    pub fn merge(&mut self, other: Compliance) {
        self.violations.extend(other.violations);
    }
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        implementation_date: Date,
        ca: KeyRecord,
        key_len: u32,
        key_lifespan: i64,
        algorithms: impl IntoIterator<Item = Algorithm>,
    ) -> Self {
        Self {
            name: name.into(),
            implementation_date,
            ca,
            key_len,
            key_lifespan,
            algorithms: algorithms.into_iter().collect(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn implementation_date(&self) -> Date {
        self.implementation_date
    }

    pub fn ca(&self) -> &KeyRecord {
        &self.ca
    }

    pub fn key_len(&self) -> u32 {
        self.key_len
    }

    pub fn key_lifespan(&self) -> i64 {
        self.key_lifespan
    }

    pub fn algorithms(&self) -> &BTreeSet<Algorithm> {
        &self.algorithms
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn check_length(&self, backend: &dyn KeyBackend, key: &KeyRecord) -> Result<Compliance> {
        let length = key.min_length(backend)?;
        if length < self.key_len {
            let message = format!(
                "Key '{key}' has key length {length} but at least {} is required by '{self}'.",
                self.key_len
            );
            return Ok(Compliance::violated(key, ViolationKind::KeyLength, message));
        }
        Ok(Compliance::passed())
    }

    pub fn check_algorithms(
        &self,
        backend: &dyn KeyBackend,
        key: &KeyRecord,
    ) -> Result<Compliance> {
        if self.algorithms.is_empty() {
            return Ok(Compliance::passed());
        }

        let forbidden: Vec<String> = key
            .algorithms(backend)?
            .difference(&self.algorithms)
            .map(ToString::to_string)
            .collect();
        if !forbidden.is_empty() {
            let message = format!(
                "Key '{key}' uses algorithm(s) '{}' which is/are not in '{}' as mandated by '{self}'.",
                forbidden.join(","),
                self.algorithm_names()
            );
            return Ok(Compliance::violated(key, ViolationKind::Algorithm, message));
        }
        Ok(Compliance::passed())
    }

    pub fn check_expiration(
        &self,
        backend: &dyn KeyBackend,
        key: &KeyRecord,
    ) -> Result<Compliance> {
        self.check_expiration_at(backend, key, today())
    }

    /// Expiration check as of `today`: a key must not expire later than `today` plus the
    /// policy's lifespan. Keys without expiry only pass when the lifespan is zero or less.
    pub fn check_expiration_at(
        &self,
        backend: &dyn KeyBackend,
        key: &KeyRecord,
        today: Date,
    ) -> Result<Compliance> {
        let Some(expires) = key.expires_at(backend)?.map(utc_date) else {
            if self.key_lifespan <= 0 {
                return Ok(Compliance::passed());
            }
            let message = format!(
                "Key '{key}' does not expire but expiry of {} days is mandated by '{self}'.",
                self.key_lifespan
            );
            return Ok(Compliance::violated(key, ViolationKind::Expiration, message));
        };

        let max_expiry = add_days(today, self.key_lifespan).context(DateSnafu)?;
        if max_expiry < expires {
            let message = format!(
                "Key '{key}' expires on {expires} but max allowed expiration date is {max_expiry}."
            );
            return Ok(Compliance::violated(key, ViolationKind::Expiration, message));
        }
        Ok(Compliance::passed())
    }

    pub fn check_ca_signature(
        &self,
        backend: &dyn KeyBackend,
        key: &KeyRecord,
    ) -> Result<Compliance> {
        if !key.is_signed_by(backend, &self.ca)? {
            let message = format!(
                "No UID of Key '{key}' has a valid signature of the CA key '{}'.",
                self.ca
            );
            return Ok(Compliance::violated(key, ViolationKind::CaSignature, message));
        }
        Ok(Compliance::passed())
    }

    /// Run every check, the CA signature one only if `check_ca_signature` is set.
    ///
    /// All checks run even after one failed, so the result lists every violation.
    pub fn check(
        &self,
        backend: &dyn KeyBackend,
        key: &KeyRecord,
        check_ca_signature: bool,
    ) -> Result<Compliance> {
        self.check_at(backend, key, today(), check_ca_signature)
    }

    pub fn check_at(
        &self,
        backend: &dyn KeyBackend,
        key: &KeyRecord,
        today: Date,
        check_ca_signature: bool,
    ) -> Result<Compliance> {
        let mut compliance = self.check_length(backend, key)?;
        compliance.merge(self.check_algorithms(backend, key)?);
        compliance.merge(self.check_expiration_at(backend, key, today)?);
        if check_ca_signature {
            compliance.merge(self.check_ca_signature(backend, key)?);
        }
        Ok(compliance)
    }

    fn algorithm_names(&self) -> String {
        self.algorithms
            .iter()
            .map(Algorithm::name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: ({}, {}, ({}))",
            self.name,
            self.key_len,
            self.key_lifespan,
            self.algorithm_names()
        )
    }
}
