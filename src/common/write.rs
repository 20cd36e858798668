//! [`Write`] — the tuple `(key, value, rid, version, action)` that flows
//! from a client operation's accumulated mutations through the Limbo and
//! into Database Blocks.

use crate::encoding::{Decode, Encode, EncodingError};

use super::{Action, Rid, Value, Version};

/// One pending mutation: "at `version`, `action` the pair `(key, value)` for
/// `rid`".
///
/// A `Write` carries its version through every storage context change: it
/// is created with [`Version::NO_VERSION`] while staged in an
/// [`crate::atomic::AtomicOperation`]'s private Limbo, then rewritten with
/// the real commit version by [`crate::atomic::AtomicOperation::complete`]
/// before being transported to the Engine's Limbo.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    /// The field name this write applies to.
    pub key: String,
    /// The field value being added or removed.
    pub value: Value,
    /// The record this write applies to.
    pub rid: Rid,
    /// The commit version this write was assigned, or `NO_VERSION`.
    pub version: Version,
    /// Whether this write adds or removes `(key, value)`.
    pub action: Action,
}

impl Write {
    /// Build a new, not-yet-versioned `Write`.
    pub fn new(key: impl Into<String>, value: Value, rid: Rid, action: Action) -> Self {
        Self {
            key: key.into(),
            value,
            rid,
            version: Version::NO_VERSION,
            action,
        }
    }

    /// The `(key, value, rid)` topic this write toggles — used by
    /// [`crate::limbo::ToggleQueue`] to collapse duplicate toggles.
    pub fn topic(&self) -> (String, Value, Rid) {
        (self.key.clone(), self.value.clone(), self.rid)
    }
}

impl Encode for Write {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.action.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.rid.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Write {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (action, n) = Action::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = Version::decode_from(&buf[offset..])?;
        offset += n;
        let (rid, n) = Rid::decode_from(&buf[offset..])?;
        offset += n;
        let (key, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = Value::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Write {
                key,
                value,
                rid,
                version,
                action,
            },
            offset,
        ))
    }
}
