//! Kernel-wide and per-vat options.
//!
//! Options arrive from hosts as loosely-typed JSON maps, so every change is
//! validated in full before anything is applied.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;

const THRESHOLD_REASON: &str = "must be a positive number or \"never\"";
const COUNT_REASON: &str = "must be a positive number";

/// A positive count, or `never`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Threshold {
    Never,
    Every(NonZeroU64),
}

impl Threshold {
    pub fn every(count: u64) -> Self {
        NonZeroU64::new(count).map_or(Threshold::Never, Threshold::Every)
    }

    /// Whether `count` has reached this threshold.
    pub fn reached(self, count: u64) -> bool {
        match self {
            Threshold::Never => false,
            Threshold::Every(limit) => count >= limit.get(),
        }
    }

    pub fn parse_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s == "never" => Some(Threshold::Never),
            Value::Number(n) => n.as_u64().and_then(NonZeroU64::new).map(Threshold::Every),
            _ => None,
        }
    }

    pub fn parse_kv(s: &str) -> Option<Self> {
        if s == "never" {
            return Some(Threshold::Never);
        }
        s.parse().ok().and_then(NonZeroU64::new).map(Threshold::Every)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Never => f.write_str("never"),
            Threshold::Every(n) => write!(f, "{n}"),
        }
    }
}

impl TryFrom<Value> for Threshold {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Threshold::parse_value(&value).ok_or_else(|| format!("{value} {THRESHOLD_REASON}"))
    }
}

impl From<Threshold> for Value {
    fn from(value: Threshold) -> Self {
        match value {
            Threshold::Never => Value::String("never".into()),
            Threshold::Every(n) => Value::from(n.get()),
        }
    }
}

fn threshold_option(option: &str, value: &Value) -> Result<Threshold, KernelError> {
    Threshold::parse_value(value)
        .ok_or_else(|| KernelError::invalid_option(option, value, THRESHOLD_REASON))
}

fn count_option(option: &str, value: &Value) -> Result<u64, KernelError> {
    value
        .as_u64()
        .filter(|n| *n > 0)
        .ok_or_else(|| KernelError::invalid_option(option, value, COUNT_REASON))
}

fn as_object<'a>(what: &str, value: &'a Value) -> Result<&'a serde_json::Map<String, Value>, KernelError> {
    value
        .as_object()
        .ok_or_else(|| KernelError::invalid_option(what, value, "must be an object"))
}

pub const DEFAULT_MANAGER_TYPE: &str = "local";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelOptions {
    pub default_manager_type: String,
    pub default_reap_interval: Threshold,
    #[serde(rename = "defaultReapGCKrefs")]
    pub default_reap_gc_krefs: Threshold,
    /// Deliveries before the first snapshot of an incarnation.
    pub snapshot_initial: u64,
    /// Deliveries between later snapshots.
    pub snapshot_interval: u64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            default_manager_type: DEFAULT_MANAGER_TYPE.to_string(),
            default_reap_interval: Threshold::every(1000),
            default_reap_gc_krefs: Threshold::every(20),
            snapshot_initial: 3,
            snapshot_interval: 200,
        }
    }
}

impl KernelOptions {
    /// Parse a JSON configuration document. Absent fields take defaults.
    pub fn from_json_str(text: &str) -> Result<Self, KernelError> {
        let value: Value = serde_json::from_str(text)?;
        KernelOptions::default().with_changes(&value)
    }

    /// Apply a `changeKernelOptions` map, returning the new options. Nothing
    /// is applied unless every entry is valid.
    pub fn with_changes(&self, changes: &Value) -> Result<Self, KernelError> {
        let mut next = self.clone();
        for (option, value) in as_object("kernel options", changes)? {
            match option.as_str() {
                "defaultReapInterval" => next.default_reap_interval = threshold_option(option, value)?,
                "defaultReapGCKrefs" => next.default_reap_gc_krefs = threshold_option(option, value)?,
                "snapshotInitial" => next.snapshot_initial = count_option(option, value)?,
                "snapshotInterval" => next.snapshot_interval = count_option(option, value)?,
                "defaultManagerType" => {
                    next.default_manager_type = value
                        .as_str()
                        .filter(|s| !s.is_empty())
                        .ok_or_else(|| KernelError::invalid_option(option, value, "must be a manager type name"))?
                        .to_string();
                }
                _ => {
                    return Err(KernelError::invalid_option(
                        option,
                        value,
                        "is not a known kernel option",
                    ));
                }
            }
        }
        Ok(next)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// A critical vat's termination panics the kernel.
    pub critical: bool,
    /// Messages to unresolved promises this vat decides are delivered to it
    /// instead of waiting for resolution.
    pub enable_pipelining: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reap_interval: Option<Threshold>,
    #[serde(rename = "reapGCKrefs", skip_serializing_if = "Option::is_none")]
    pub reap_gc_krefs: Option<Threshold>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_interval: Option<u64>,
}

impl VatOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_pipelining(mut self) -> Self {
        self.enable_pipelining = true;
        self
    }

    pub fn with_reap_interval(mut self, interval: Threshold) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }
}

/// A validated `changeVatOptions` request. Options the kernel does not own
/// are forwarded to the vat untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VatOptionChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reap_interval: Option<Threshold>,
    #[serde(rename = "reapGCKrefs", skip_serializing_if = "Option::is_none")]
    pub reap_gc_krefs: Option<Threshold>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub forwarded: BTreeMap<String, Value>,
}

impl VatOptionChanges {
    pub fn parse(changes: &Value) -> Result<Self, KernelError> {
        let mut parsed = VatOptionChanges::default();
        for (option, value) in as_object("vat options", changes)? {
            match option.as_str() {
                "reapInterval" => parsed.reap_interval = Some(threshold_option(option, value)?),
                "reapGCKrefs" => parsed.reap_gc_krefs = Some(threshold_option(option, value)?),
                "critical" | "managerType" | "name" => {
                    return Err(KernelError::invalid_option(
                        option,
                        value,
                        "cannot be changed after creation",
                    ));
                }
                _ => {
                    parsed.forwarded.insert(option.clone(), value.clone());
                }
            }
        }
        Ok(parsed)
    }

    pub fn apply(&self, options: &mut VatOptions) {
        if let Some(interval) = self.reap_interval {
            options.reap_interval = Some(interval);
        }
        if let Some(krefs) = self.reap_gc_krefs {
            options.reap_gc_krefs = Some(krefs);
        }
    }
}
