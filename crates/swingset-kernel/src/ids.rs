//! Kernel and vat-local identifiers.
//!
//! Kernel identifiers are globally unique and monotonically allocated:
//! `v1` (vat), `d7` (device), `ko20` (object), `kp40` (promise), `kd30`
//! (device node). Vat-local references use the `o+3` / `p-7` / `d-2` grammar
//! where `+` marks an identifier allocated by the vat itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}'")]
pub struct ParseRefError {
    kind: &'static str,
    value: String,
}

impl ParseRefError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

fn parse_index(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

macro_rules! numbered_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub u64);

        impl $name {
            pub fn index(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseRefError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.strip_prefix($prefix)
                    .and_then(parse_index)
                    .map($name)
                    .ok_or_else(|| ParseRefError::new(stringify!($name), s))
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseRefError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_string()
            }
        }
    };
}

numbered_id!(
    /// Vat identifier, `v<N>`.
    VatId,
    "v"
);
numbered_id!(
    /// Device identifier, `d<N>`.
    DeviceId,
    "d"
);
numbered_id!(
    /// Kernel object reference, `ko<N>`.
    KRef,
    "ko"
);
numbered_id!(
    /// Kernel promise identifier, `kp<N>`.
    KPid,
    "kp"
);
numbered_id!(
    /// Kernel device node, `kd<N>`.
    KDevice,
    "kd"
);

/// Any kernel-side identity that can appear in capdata slots or c-lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KernelSlot {
    Object(KRef),
    Promise(KPid),
    Device(KDevice),
}

impl KernelSlot {
    pub fn as_object(self) -> Option<KRef> {
        match self {
            KernelSlot::Object(kref) => Some(kref),
            _ => None,
        }
    }

    pub fn as_promise(self) -> Option<KPid> {
        match self {
            KernelSlot::Promise(kpid) => Some(kpid),
            _ => None,
        }
    }

    pub fn kind(self) -> SlotKind {
        match self {
            KernelSlot::Object(_) => SlotKind::Object,
            KernelSlot::Promise(_) => SlotKind::Promise,
            KernelSlot::Device(_) => SlotKind::Device,
        }
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSlot::Object(kref) => fmt::Display::fmt(kref, f),
            KernelSlot::Promise(kpid) => fmt::Display::fmt(kpid, f),
            KernelSlot::Device(kd) => fmt::Display::fmt(kd, f),
        }
    }
}

impl FromStr for KernelSlot {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("ko") {
            s.parse().map(KernelSlot::Object)
        } else if s.starts_with("kp") {
            s.parse().map(KernelSlot::Promise)
        } else if s.starts_with("kd") {
            s.parse().map(KernelSlot::Device)
        } else {
            Err(ParseRefError::new("KernelSlot", s))
        }
    }
}

impl TryFrom<String> for KernelSlot {
    type Error = ParseRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KernelSlot> for String {
    fn from(value: KernelSlot) -> Self {
        value.to_string()
    }
}

impl From<KRef> for KernelSlot {
    fn from(value: KRef) -> Self {
        KernelSlot::Object(value)
    }
}

impl From<KPid> for KernelSlot {
    fn from(value: KPid) -> Self {
        KernelSlot::Promise(value)
    }
}

impl From<KDevice> for KernelSlot {
    fn from(value: KDevice) -> Self {
        KernelSlot::Device(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotKind {
    Object,
    Promise,
    Device,
}

impl SlotKind {
    fn tag(self) -> char {
        match self {
            SlotKind::Object => 'o',
            SlotKind::Promise => 'p',
            SlotKind::Device => 'd',
        }
    }
}

/// How a vat-allocated object export survives an upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExportFlavor {
    /// `o+N`: lives in the worker's RAM.
    Ephemeral,
    /// `o+vN`: virtual, stored in the vatstore but not upgrade-durable.
    Virtual,
    /// `o+dN`: durable across upgrades.
    Durable,
}

/// Vat-local reference: `o+3`, `o-7`, `p+2`, `d-1`, `o+d4/2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatSlot {
    pub kind: SlotKind,
    pub allocated_by_vat: bool,
    pub flavor: ExportFlavor,
    pub id: u64,
    pub facet: Option<u64>,
}

impl VatSlot {
    fn plain(kind: SlotKind, allocated_by_vat: bool, id: u64) -> Self {
        Self {
            kind,
            allocated_by_vat,
            flavor: ExportFlavor::Ephemeral,
            id,
            facet: None,
        }
    }

    /// The vat's root object, `o+0`.
    pub fn root() -> Self {
        Self::export(0)
    }

    pub fn export(id: u64) -> Self {
        Self::plain(SlotKind::Object, true, id)
    }

    pub fn durable_export(id: u64) -> Self {
        Self {
            flavor: ExportFlavor::Durable,
            ..Self::export(id)
        }
    }

    pub fn virtual_export(id: u64) -> Self {
        Self {
            flavor: ExportFlavor::Virtual,
            ..Self::export(id)
        }
    }

    pub fn import(kind: SlotKind, id: u64) -> Self {
        Self::plain(kind, false, id)
    }

    /// A promise allocated by the vat, `p+N`.
    pub fn promise(id: u64) -> Self {
        Self::plain(SlotKind::Promise, true, id)
    }

    pub fn is_object(&self) -> bool {
        self.kind == SlotKind::Object
    }

    pub fn is_promise(&self) -> bool {
        self.kind == SlotKind::Promise
    }

    pub fn is_device(&self) -> bool {
        self.kind == SlotKind::Device
    }

    pub fn is_root(&self) -> bool {
        *self == Self::root()
    }

    pub fn is_durable(&self) -> bool {
        self.flavor == ExportFlavor::Durable
    }
}

impl fmt::Display for VatSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.allocated_by_vat { '+' } else { '-' };
        let flavor = match self.flavor {
            ExportFlavor::Ephemeral => "",
            ExportFlavor::Virtual => "v",
            ExportFlavor::Durable => "d",
        };
        write!(f, "{}{}{}{}", self.kind.tag(), sign, flavor, self.id)?;
        if let Some(facet) = self.facet {
            write!(f, "/{facet}")?;
        }
        Ok(())
    }
}

impl FromStr for VatSlot {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseRefError::new("VatSlot", s);
        let mut chars = s.chars();
        let kind = match chars.next() {
            Some('o') => SlotKind::Object,
            Some('p') => SlotKind::Promise,
            Some('d') => SlotKind::Device,
            _ => return Err(bad()),
        };
        let allocated_by_vat = match chars.next() {
            Some('+') => true,
            Some('-') => false,
            _ => return Err(bad()),
        };
        let rest = chars.as_str();
        let (flavor, rest) = match rest.chars().next() {
            Some('v') if allocated_by_vat && kind == SlotKind::Object => {
                (ExportFlavor::Virtual, &rest[1..])
            }
            Some('d') if allocated_by_vat && kind == SlotKind::Object => {
                (ExportFlavor::Durable, &rest[1..])
            }
            _ => (ExportFlavor::Ephemeral, rest),
        };
        let (id, facet) = match rest.split_once('/') {
            Some((id, facet)) => (id, Some(parse_index(facet).ok_or_else(bad)?)),
            None => (rest, None),
        };
        Ok(Self {
            kind,
            allocated_by_vat,
            flavor,
            id: parse_index(id).ok_or_else(bad)?,
            facet,
        })
    }
}

impl TryFrom<String> for VatSlot {
    type Error = ParseRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VatSlot> for String {
    fn from(value: VatSlot) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_slots_parse_by_prefix() {
        assert_eq!("ko20".parse::<KernelSlot>().unwrap(), KernelSlot::Object(KRef(20)));
        assert_eq!("kp41".parse::<KernelSlot>().unwrap(), KernelSlot::Promise(KPid(41)));
        assert_eq!("kd30".parse::<KernelSlot>().unwrap(), KernelSlot::Device(KDevice(30)));
        assert!("kx1".parse::<KernelSlot>().is_err());
        assert!("v+1".parse::<VatId>().is_err());
    }

    #[test]
    fn vat_slots_cover_export_flavors() {
        let durable: VatSlot = "o+d12/3".parse().unwrap();
        assert!(durable.is_durable());
        assert_eq!(durable.facet, Some(3));
        assert_eq!(durable.to_string(), "o+d12/3");

        let import: VatSlot = "o-50".parse().unwrap();
        assert!(!import.allocated_by_vat);
        assert_eq!(import.flavor, ExportFlavor::Ephemeral);

        assert!(VatSlot::root().is_root());
        assert_eq!(VatSlot::virtual_export(4).to_string(), "o+v4");
        assert!("p+d1".parse::<VatSlot>().is_err());
        assert!("o*1".parse::<VatSlot>().is_err());
    }

    #[test]
    fn identifiers_serialize_as_strings() {
        let json = serde_json::to_string(&vec![KernelSlot::Object(KRef(20))]).unwrap();
        assert_eq!(json, r#"["ko20"]"#);
        let slot: VatSlot = serde_json::from_str(r#""p-61""#).unwrap();
        assert_eq!(slot, VatSlot::import(SlotKind::Promise, 61));
    }
}
