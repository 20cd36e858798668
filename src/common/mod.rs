//! Data-model primitives shared across the whole crate: [`Rid`], [`Version`],
//! [`Action`], [`Value`], [`Bound`], [`Write`] and the [`Operator`] used by
//! Secondary `explore`.
//!
//! These are the Byteable/Codec primitives: fixed/variable binary encoding
//! for locators, keys, values, positions and tokens. Every type here
//! round-trips through
//! [`crate::encoding`] so it can be written into a [`crate::block::Block`]
//! or a [`crate::limbo::Queue`] unchanged.

#[cfg(test)]
mod tests;

mod value;
mod write;

pub use value::{Bound, Value};
pub use write::Write;

use std::fmt;

use thiserror::Error;

use crate::encoding::{Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by write-path validation.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A write named a key that is reserved or otherwise unwritable.
    #[error("key {0:?} is not writable")]
    InvalidKey(String),

    /// A write carried a value considered "blank" (e.g. an empty string).
    #[error("value for key {0:?} is blank")]
    BlankValue(String),
}

// ------------------------------------------------------------------------------------------------
// Rid
// ------------------------------------------------------------------------------------------------

/// A 64-bit record identifier.
///
/// `Rid` is the `L` (locator) of a Primary revision and the `V` of a
/// Secondary revision; it is also the unit the [`crate::inventory::Inventory`]
/// tracks. Encoded as 8 raw little-endian bytes (fixed-size, no length
/// prefix) so it matches the "Primary locator is fixed 8 bytes" rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid(pub u64);

impl Rid {
    /// Build an `Rid` from a raw `u64`.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The wrapped `u64`.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Rid {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Encode for Rid {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)
    }
}

impl Decode for Rid {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (v, n) = u64::decode_from(buf)?;
        Ok((Rid(v), n))
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// A monotonically-increasing identifier assigned per commit group.
///
/// `Version::NO_VERSION` (zero) marks a `Write` that has not yet been
/// assigned a version and therefore must never be stored durably; it is
/// overwritten by [`crate::atomic::AtomicOperation::complete`] before the
/// write reaches the Engine's Limbo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub u64);

impl Version {
    /// Sentinel meaning "not yet assigned, not storable".
    pub const NO_VERSION: Version = Version(0);

    /// Whether this version is the sentinel [`Version::NO_VERSION`].
    pub fn is_assigned(self) -> bool {
        self != Self::NO_VERSION
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Encode for Version {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)
    }
}

impl Decode for Version {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (v, n) = u64::decode_from(buf)?;
        Ok((Version(v), n))
    }
}

// ------------------------------------------------------------------------------------------------
// Action
// ------------------------------------------------------------------------------------------------

/// The logical effect of a [`Write`]: adding or removing a (key, value) pair
/// for a record.
///
/// `Compare` is a sentinel retained only as an illegal marker: it is never
/// produced by write APIs and any attempt to decode it from storage is a
/// corruption error. The Record-append algorithm is standardized on this
/// type exclusively; there is no count-based alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// The value is being added to the record's present state.
    Add,
    /// The value is being removed from the record's present state.
    Remove,
    /// Illegal sentinel; any write carrying this action is rejected.
    Compare,
}

impl Encode for Action {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            Action::Add => 0,
            Action::Remove => 1,
            Action::Compare => 2,
        };
        tag.encode_to(buf)
    }
}

impl Decode for Action {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        let action = match tag {
            0 => Action::Add,
            1 => Action::Remove,
            2 => Action::Compare,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Action",
                });
            }
        };
        Ok((action, n))
    }
}

// ------------------------------------------------------------------------------------------------
// Operator — Secondary `explore`
// ------------------------------------------------------------------------------------------------

/// Comparison operator accepted by [`crate::record::Record::explore`].
///
/// String comparisons are case-insensitive; CON-667 (see crate-level design
/// notes) folds the bound value's case before comparison so that the
/// natural byte order of [`Value`] (uppercase < lowercase) still yields the
/// intended inclusion semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `value == bound` (case-insensitive for strings).
    Equals,
    /// `value != bound`.
    NotEquals,
    /// `value > bound`.
    Gt,
    /// `value >= bound`.
    Gte,
    /// `value < bound`.
    Lt,
    /// `value <= bound`.
    Lte,
    /// `lower <= value <= upper`.
    Between,
    /// String value matches a regular expression.
    Regex,
    /// String value does not match a regular expression.
    NotRegex,
    /// String value contains a substring (case-insensitive).
    Contains,
    /// String value does not contain a substring. Specified strictly as
    /// "not in": no special-cased early exit that would also admit a true
    /// "contains" match.
    NotContains,
}

impl Encode for Operator {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let tag: u8 = match self {
            Operator::Equals => 0,
            Operator::NotEquals => 1,
            Operator::Gt => 2,
            Operator::Gte => 3,
            Operator::Lt => 4,
            Operator::Lte => 5,
            Operator::Between => 6,
            Operator::Regex => 7,
            Operator::NotRegex => 8,
            Operator::Contains => 9,
            Operator::NotContains => 10,
        };
        tag.encode_to(buf)
    }
}

impl Decode for Operator {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, n) = u8::decode_from(buf)?;
        let op = match tag {
            0 => Operator::Equals,
            1 => Operator::NotEquals,
            2 => Operator::Gt,
            3 => Operator::Gte,
            4 => Operator::Lt,
            5 => Operator::Lte,
            6 => Operator::Between,
            7 => Operator::Regex,
            8 => Operator::NotRegex,
            9 => Operator::Contains,
            10 => Operator::NotContains,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Operator",
                });
            }
        };
        Ok((op, n))
    }
}
