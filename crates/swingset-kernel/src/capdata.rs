//! Capability data: an opaque serialized body plus the identities it refers to.
//!
//! Bodies use the `#`-prefixed JSON encoding, where `"$N"` strings (optionally
//! followed by `.Alleged: name`) refer to `slots[N]`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::{KPid, KernelSlot};

const BODY_PREFIX: char = '#';

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<S> {
    pub body: String,
    pub slots: Vec<S>,
}

impl<S> CapData<S> {
    pub fn new(body: impl Into<String>, slots: Vec<S>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Encode a JSON value as a body.
    pub fn from_json(value: &Value, slots: Vec<S>) -> Self {
        Self::new(format!("{BODY_PREFIX}{value}"), slots)
    }

    pub fn undefined() -> Self {
        Self::from_json(&json!("#undefined"), Vec::new())
    }

    /// A body that is a bare reference to its only slot.
    pub fn slot(slot: S) -> Self {
        Self::from_json(&json!("$0"), vec![slot])
    }

    /// The kernel's own rejection reasons, e.g. "vat terminated".
    pub fn error(message: impl Into<String>) -> Self {
        Self::from_json(
            &json!({ "#error": message.into(), "name": "Error" }),
            Vec::new(),
        )
    }

    /// The reason promises decided by an upgraded vat are rejected with.
    pub fn upgrade_disconnection(upgrade_message: &str, incarnation: u64) -> Self {
        Self::from_json(
            &json!({
                "#error": "vat upgraded",
                "name": "vatUpgraded",
                "upgradeMessage": upgrade_message,
                "incarnationNumber": incarnation,
            }),
            Vec::new(),
        )
    }

    pub fn to_json(&self) -> Option<Value> {
        let json = self.body.strip_prefix(BODY_PREFIX)?;
        serde_json::from_str(json).ok()
    }

    /// The `#error` message, when the body encodes an error.
    pub fn error_message(&self) -> Option<String> {
        match self.to_json()? {
            Value::Object(map) => map.get("#error")?.as_str().map(str::to_string),
            _ => None,
        }
    }

    pub fn try_map_slots<T, E>(
        &self,
        mut f: impl FnMut(&S) -> Result<T, E>,
    ) -> Result<CapData<T>, E> {
        let slots = self.slots.iter().map(&mut f).collect::<Result<Vec<_>, E>>()?;
        Ok(CapData {
            body: self.body.clone(),
            slots,
        })
    }
}

impl<S: Clone> CapData<S> {
    /// The slot this data designates when the body is nothing but a reference
    /// to a single slot.
    pub fn single_slot(&self) -> Option<S> {
        if self.slots.len() != 1 {
            return None;
        }
        let Value::String(reference) = self.to_json()? else {
            return None;
        };
        let rest = reference.strip_prefix("$0")?;
        if rest.is_empty() || rest.starts_with('.') {
            self.slots.first().cloned()
        } else {
            None
        }
    }
}

/// A message addressed to a kernel target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub method: String,
    pub args: CapData<KernelSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<KPid>,
}

impl Message {
    pub fn new(method: impl Into<String>, args: CapData<KernelSlot>, result: Option<KPid>) -> Self {
        Self {
            method: method.into(),
            args,
            result,
        }
    }

    /// Result promise first, then argument slots.
    pub fn slots(&self) -> impl Iterator<Item = KernelSlot> + '_ {
        self.result
            .map(KernelSlot::Promise)
            .into_iter()
            .chain(self.args.slots.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::KRef;

    #[test]
    fn single_slot_requires_a_bare_reference() {
        let bare: CapData<KernelSlot> = CapData::slot(KRef(20).into());
        assert_eq!(bare.single_slot(), Some(KernelSlot::Object(KRef(20))));

        let alleged = CapData::new(r##"#"$0.Alleged: thing""##, vec![KernelSlot::Object(KRef(21))]);
        assert_eq!(alleged.single_slot(), Some(KernelSlot::Object(KRef(21))));

        let record = CapData::from_json(&json!({ "x": "$0" }), vec![KernelSlot::Object(KRef(22))]);
        assert_eq!(record.single_slot(), None);

        let other = CapData::from_json(&json!("$01"), vec![KernelSlot::Object(KRef(22))]);
        assert_eq!(other.single_slot(), None);
    }

    #[test]
    fn kernel_errors_expose_their_message() {
        let data: CapData<KernelSlot> = CapData::error("vat terminated");
        assert_eq!(data.error_message().as_deref(), Some("vat terminated"));
        let upgraded: CapData<KernelSlot> = CapData::upgrade_disconnection("v2", 1);
        assert_eq!(upgraded.error_message().as_deref(), Some("vat upgraded"));
        assert_eq!(CapData::<KernelSlot>::undefined().error_message(), None);
    }
}
