//! [`Revision`] — the indexed form of a [`crate::common::Write`] at one of
//! three orientations, plus the comparable wrapper types ([`Locator`],
//! [`Key`], [`SortValue`]) that give every orientation a uniform sort key.
//!
//! `Revision` is a tagged sum over the three orientations rather than
//! dynamic dispatch or a generic `Revision<L, K, V>` (which would need
//! matching generic `Block<L, K, V>`/`Record<L, K, V>` types and non-trivial
//! trait bounds to hash/compare/serialize three unrelated shapes): every
//! variant is spelled out explicitly and shares one set of helper methods.

use std::cmp::Ordering;

use crate::common::{Action, Rid, Value, Version};
use crate::encoding::{Decode, Encode, EncodingError};

/// Which of the three parallel indexes a [`crate::block::Block`] or
/// [`crate::record::Record`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    /// L=RID, K=key, V=value — "what is in record R".
    Primary,
    /// L=key, K=value, V=RID — "which records have key=value".
    Secondary,
    /// L=key, K=term, V=(RID, position) — infix search.
    Search,
}

impl Orientation {
    /// Directory name under `<env>/db/` for blocks of this orientation.
    pub fn dir_name(self) -> &'static str {
        match self {
            Orientation::Primary => "cpb",
            Orientation::Secondary => "csb",
            Orientation::Search => "ctb",
        }
    }
}

/// `(RID, position)` — the `V` of a Search revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// Record the term occurrence belongs to.
    pub rid: Rid,
    /// Zero-based word offset within the value's tokenized form.
    pub pos: u32,
}

impl Encode for Position {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.rid.encode_to(buf)?;
        self.pos.encode_to(buf)
    }
}

impl Decode for Position {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (rid, n1) = Rid::decode_from(buf)?;
        let (pos, n2) = u32::decode_from(&buf[n1..])?;
        Ok((Position { rid, pos }, n1 + n2))
    }
}

/// The locator (`L`) column of a Revision, comparable across a single
/// Block's homogeneous orientation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// Primary locator: the record id.
    Rid(Rid),
    /// Secondary/Search locator: the field key.
    Key(String),
}

impl PartialOrd for Locator {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Locator {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Locator::Rid(a), Locator::Rid(b)) => a.cmp(b),
            (Locator::Key(a), Locator::Key(b)) => a.cmp(b),
            (Locator::Rid(_), Locator::Key(_)) => Ordering::Less,
            (Locator::Key(_), Locator::Rid(_)) => Ordering::Greater,
        }
    }
}

impl Encode for Locator {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Locator::Rid(r) => {
                0u8.encode_to(buf)?;
                r.encode_to(buf)
            }
            Locator::Key(k) => {
                1u8.encode_to(buf)?;
                k.encode_to(buf)
            }
        }
    }
}

/// The key (`K`) column of a Revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Primary/Search key: the field name or search term.
    Text(String),
    /// Secondary key: the field value.
    Value(Value),
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (Key::Value(a), Key::Value(b)) => a.cmp(b),
            (Key::Text(_), Key::Value(_)) => Ordering::Less,
            (Key::Value(_), Key::Text(_)) => Ordering::Greater,
        }
    }
}

impl Encode for Key {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Key::Text(t) => {
                0u8.encode_to(buf)?;
                t.encode_to(buf)
            }
            Key::Value(v) => {
                1u8.encode_to(buf)?;
                v.encode_to(buf)
            }
        }
    }
}

/// The value (`V`) column of a Revision, used as the final sort tiebreaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SortValue {
    /// Primary value.
    Value(Value),
    /// Secondary value: the owning record id.
    Rid(Rid),
    /// Search value: the term occurrence.
    Position(Position),
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Value(a), SortValue::Value(b)) => a.cmp(b),
            (SortValue::Rid(a), SortValue::Rid(b)) => a.cmp(b),
            (SortValue::Position(a), SortValue::Position(b)) => a.cmp(b),
            (a, b) => discriminant(a).cmp(&discriminant(b)),
        }
    }
}

fn discriminant(v: &SortValue) -> u8 {
    match v {
        SortValue::Value(_) => 0,
        SortValue::Rid(_) => 1,
        SortValue::Position(_) => 2,
    }
}

/// The indexed form of a [`crate::common::Write`] at a fixed orientation.
///
/// Revisions within a Block are strictly ordered by `(locator, key,
/// version, value)` (invariant 2); `Ord` reflects exactly that tuple via
/// [`Revision::sort_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub orientation: Orientation,
    pub action: Action,
    pub version: Version,
    pub locator: Locator,
    pub key: Key,
    pub value: SortValue,
}

impl Revision {
    /// Build a Primary revision: L=RID, K=key, V=value.
    pub fn primary(rid: Rid, key: impl Into<String>, value: Value, version: Version, action: Action) -> Self {
        Self {
            orientation: Orientation::Primary,
            action,
            version,
            locator: Locator::Rid(rid),
            key: Key::Text(key.into()),
            value: SortValue::Value(value),
        }
    }

    /// Build a Secondary revision: L=key, K=value, V=RID.
    pub fn secondary(key: impl Into<String>, value: Value, rid: Rid, version: Version, action: Action) -> Self {
        Self {
            orientation: Orientation::Secondary,
            action,
            version,
            locator: Locator::Key(key.into()),
            key: Key::Value(value),
            value: SortValue::Rid(rid),
        }
    }

    /// Build a Search revision: L=key, K=term, V=(RID, position).
    pub fn search(key: impl Into<String>, term: impl Into<String>, rid: Rid, pos: u32, version: Version, action: Action) -> Self {
        Self {
            orientation: Orientation::Search,
            action,
            version,
            locator: Locator::Key(key.into()),
            key: Key::Text(term.into()),
            value: SortValue::Position(Position { rid, pos }),
        }
    }

    /// `(locator, key, version, value)` — invariant 2's sort key.
    pub fn sort_key(&self) -> (&Locator, &Key, Version, &SortValue) {
        (&self.locator, &self.key, self.version, &self.value)
    }

    pub fn rid(&self) -> Option<Rid> {
        match (&self.locator, &self.value) {
            (Locator::Rid(r), _) => Some(*r),
            (_, SortValue::Rid(r)) => Some(*r),
            (_, SortValue::Position(p)) => Some(p.rid),
            _ => None,
        }
    }

    /// Encode this revision's fields per the on-disk wire format:
    /// `action:u8, version:u64, locator, key, value`. `locator`/`key` use
    /// each wrapped type's own `Encode` (fixed 8 bytes for `Rid`,
    /// length-prefixed for `String`/`Value`).
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.action.encode_to(buf)?;
        self.version.encode_to(buf)?;
        match &self.locator {
            Locator::Rid(r) => r.encode_to(buf)?,
            Locator::Key(k) => k.encode_to(buf)?,
        }
        match &self.key {
            Key::Text(t) => t.encode_to(buf)?,
            Key::Value(v) => v.encode_to(buf)?,
        }
        match &self.value {
            SortValue::Value(v) => v.encode_to(buf)?,
            SortValue::Rid(r) => r.encode_to(buf)?,
            SortValue::Position(p) => p.encode_to(buf)?,
        }
        Ok(())
    }

    /// Decode a revision, given the orientation context that determines how
    /// the locator/key/value fields are typed.
    pub fn decode_from(orientation: Orientation, buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (action, n) = Action::decode_from(&buf[offset..])?;
        offset += n;
        let (version, n) = Version::decode_from(&buf[offset..])?;
        offset += n;

        let locator = match orientation {
            Orientation::Primary => {
                let (r, n) = Rid::decode_from(&buf[offset..])?;
                offset += n;
                Locator::Rid(r)
            }
            Orientation::Secondary | Orientation::Search => {
                let (k, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Locator::Key(k)
            }
        };

        let key = match orientation {
            Orientation::Primary | Orientation::Search => {
                let (t, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Key::Text(t)
            }
            Orientation::Secondary => {
                let (v, n) = Value::decode_from(&buf[offset..])?;
                offset += n;
                Key::Value(v)
            }
        };

        let value = match orientation {
            Orientation::Primary => {
                let (v, n) = Value::decode_from(&buf[offset..])?;
                offset += n;
                SortValue::Value(v)
            }
            Orientation::Secondary => {
                let (r, n) = Rid::decode_from(&buf[offset..])?;
                offset += n;
                SortValue::Rid(r)
            }
            Orientation::Search => {
                let (p, n) = Position::decode_from(&buf[offset..])?;
                offset += n;
                SortValue::Position(p)
            }
        };

        Ok((
            Revision {
                orientation,
                action,
                version,
                locator,
                key,
                value,
            },
            offset,
        ))
    }
}
