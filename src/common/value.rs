//! [`Value`] — the tagged union stored in every Revision's value column (for
//! Primary revisions) or key column (for Secondary revisions), plus
//! [`Bound`], the −∞/+∞-capable wrapper used by range tokens.

use std::cmp::Ordering;

use crate::encoding::{Decode, Encode, EncodingError};

use super::Rid;

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// A tagged union over the eight primitive kinds the data model allows in a
/// field.
///
/// `Value` has a total order (see [`Ord`] below): variants are ordered by
/// discriminant first (`Bool < Int < Float < Str < Link < Timestamp < Tag <
/// Blob`), then by payload. String comparison is plain byte order, which is
/// why CON-667 folds a range bound's case before comparing — see
/// [`Value::cmp_case_insensitive`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// A link to another record.
    Link(Rid),
    /// A Unix-epoch timestamp, in milliseconds.
    Timestamp(i64),
    /// An interned-style tag string (semantically distinct from `Str`, e.g.
    /// used for enum-like fields that should not be full-text searched).
    Tag(String),
    /// An opaque binary blob.
    Blob(Vec<u8>),
}

impl Value {
    /// Discriminant used for cross-variant ordering and the on-disk tag.
    fn discriminant(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Str(_) => 3,
            Value::Link(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Tag(_) => 6,
            Value::Blob(_) => 7,
        }
    }

    /// The value's string form, used for case-insensitive comparisons and
    /// for Search tokenization. Non-string values render via `Display`-like
    /// conversions so that e.g. `Int(5)` can be matched by the literal "5".
    pub fn as_text(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Link(r) => r.get().to_string(),
            Value::Timestamp(t) => t.to_string(),
            Value::Tag(s) => s.clone(),
            Value::Blob(b) => format!("<blob:{}b>", b.len()),
        }
    }

    /// Case-insensitive equality, used by Secondary `EQUALS`/`NOT_EQUALS`
    /// and by Search term matching.
    pub fn eq_case_insensitive(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) | (Value::Tag(a), Value::Tag(b)) => {
                a.eq_ignore_ascii_case(b)
            }
            _ => self == other,
        }
    }

    /// Whether this value is "blank" and therefore rejected on write
    /// (empty string content).
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Str(s) | Value::Tag(s) => s.is_empty(),
            Value::Blob(b) => b.is_empty(),
            _ => false,
        }
    }

    /// CON-667: fold a range bound's case before comparing it against a
    /// stored value, so that case-insensitive inclusion semantics survive
    /// the byte-order fact that uppercase ASCII sorts below lowercase.
    ///
    /// The exact direction mapping is preserved: `Gt`/`Lte` fold to the
    /// lower-case form, `Gte`/`Lt`/`Between` fold to the upper-case form.
    pub fn fold_bound_for_operator(&self, op: super::Operator) -> Value {
        use super::Operator::*;
        match self {
            Value::Str(s) => match op {
                Gt | Lte => Value::Str(s.to_lowercase()),
                Gte | Lt | Between => Value::Str(s.to_uppercase()),
                _ => self.clone(),
            },
            Value::Tag(s) => match op {
                Gt | Lte => Value::Tag(s.to_lowercase()),
                Gte | Lt | Between => Value::Tag(s.to_uppercase()),
                _ => self.clone(),
            },
            _ => self.clone(),
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Link(a), Value::Link(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Tag(a), Value::Tag(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => self.discriminant().cmp(&other.discriminant()),
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Str(s) | Value::Tag(s) => s.hash(state),
            Value::Link(r) => r.hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Blob(b) => b.hash(state),
        }
    }
}

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.discriminant().encode_to(buf)?;
        match self {
            Value::Bool(b) => b.encode_to(buf),
            Value::Int(i) => i.encode_to(buf),
            Value::Float(f) => f.to_bits().encode_to(buf),
            Value::Str(s) => s.encode_to(buf),
            Value::Link(r) => r.encode_to(buf),
            Value::Timestamp(t) => t.encode_to(buf),
            Value::Tag(s) => s.encode_to(buf),
            Value::Blob(b) => b.encode_to(buf),
        }
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let value = match tag {
            0 => {
                let (b, n) = bool::decode_from(&buf[offset..])?;
                offset += n;
                Value::Bool(b)
            }
            1 => {
                let (i, n) = i64::decode_from(&buf[offset..])?;
                offset += n;
                Value::Int(i)
            }
            2 => {
                let (bits, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Value::Float(f64::from_bits(bits))
            }
            3 => {
                let (s, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Value::Str(s)
            }
            4 => {
                let (r, n) = Rid::decode_from(&buf[offset..])?;
                offset += n;
                Value::Link(r)
            }
            5 => {
                let (t, n) = i64::decode_from(&buf[offset..])?;
                offset += n;
                Value::Timestamp(t)
            }
            6 => {
                let (s, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Value::Tag(s)
            }
            7 => {
                let (b, n) = Vec::<u8>::decode_from(&buf[offset..])?;
                offset += n;
                Value::Blob(b)
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Value",
                });
            }
        };
        Ok((value, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Bound — a Value extended with sentinel −∞/+∞ endpoints
// ------------------------------------------------------------------------------------------------

/// A range endpoint: either a concrete [`Value`] or one of the sentinel
/// extremes used by range tokens ([`crate::lock::ValueRange`]).
///
/// `Bound` is never persisted — it only exists transiently while building
/// or evaluating a range. `NegInf < Included(_) < PosInf` for all values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    /// Less than every possible [`Value`].
    NegInf,
    /// A concrete, inclusive endpoint.
    Included(Value),
    /// Greater than every possible [`Value`].
    PosInf,
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Bound::NegInf, Bound::NegInf) => Ordering::Equal,
            (Bound::PosInf, Bound::PosInf) => Ordering::Equal,
            (Bound::NegInf, _) => Ordering::Less,
            (_, Bound::NegInf) => Ordering::Greater,
            (Bound::PosInf, _) => Ordering::Greater,
            (_, Bound::PosInf) => Ordering::Less,
            (Bound::Included(a), Bound::Included(b)) => a.cmp(b),
        }
    }
}

impl Bound {
    /// Whether `value` falls at or past this bound when used as a lower
    /// bound (`self <= value`).
    pub fn admits_as_lower(&self, value: &Value) -> bool {
        match self {
            Bound::NegInf => true,
            Bound::PosInf => false,
            Bound::Included(v) => v <= value,
        }
    }

    /// Whether `value` falls at or before this bound when used as an upper
    /// bound (`value <= self`).
    pub fn admits_as_upper(&self, value: &Value) -> bool {
        match self {
            Bound::PosInf => true,
            Bound::NegInf => false,
            Bound::Included(v) => value <= v,
        }
    }
}
