//! Tokens, value ranges and the [`LockBroker`] used by [`crate::atomic::AtomicOperation`]
//! to JIT-lock the aggregate set of reads/writes it accumulated before commit.
//!
//! Every shared structure in this crate is guarded by `Arc<RwLock<_>>` or
//! `Arc<Mutex<_>>`; the keyed permit-table here is a `HashMap<Token, _>` of
//! per-token locks, the shape MVCC implementations commonly use for keyed
//! lock tables.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::trace;

use crate::common::{Bound, Operator, Rid, Value};
use crate::encoding::{Decode, Encode, EncodingError, decode_vec, encode_vec};

/// Errors raised while acquiring or releasing locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// A non-blocking lock attempt failed because the token was already
    /// held in a conflicting mode.
    #[error("token {0:?} is already locked")]
    WouldBlock(Token),
    /// Internal consistency error (poisoned lock).
    #[error("internal lock error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Token
// ------------------------------------------------------------------------------------------------

/// An opaque, hashable handle used both to acquire locks on the
/// [`LockBroker`] and to route version-change events to subscribed
/// [`crate::atomic::AtomicOperation`]s.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Token {
    /// A "wide" token covering every key of one record. Exempt from causing
    /// preemption of its own holder when acquired as a write (CON-669).
    Wide(Rid),
    /// A single `(key, rid)` cell.
    Cell(String, Rid),
    /// Every occurrence of one field name across all records.
    Field(String),
    /// A range of values for one field, used by range reads/writes.
    Range(String, RangeSpec),
}

impl Token {
    /// Build a point token for `(rid)`.
    pub fn wrap_rid(rid: Rid) -> Self {
        Token::Wide(rid)
    }

    /// Build a point token for `(key, rid)`.
    pub fn wrap_cell(key: impl Into<String>, rid: Rid) -> Self {
        Token::Cell(key.into(), rid)
    }

    /// Build a point token for `(key)`.
    pub fn wrap_field(key: impl Into<String>) -> Self {
        Token::Field(key.into())
    }

    /// Build a "shareable" write token: same identity as [`Token::wrap_rid`]
    /// but constructed from the write path, documented separately so call
    /// sites read intention-first.
    pub fn shareable(rid: Rid) -> Self {
        Token::Wide(rid)
    }

    /// Build a range token from `(key, operator, bound values)`.
    pub fn range(key: impl Into<String>, op: Operator, values: Vec<Value>) -> Self {
        Token::Range(key.into(), RangeSpec { op, values })
    }
}

/// `Token` round-trips through the crate's hand-rolled codec so a
/// [`crate::transaction::Transaction`] backup file can persist the set of
/// tokens a commit held locks on (`LockDescription` records).
impl Encode for Token {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Token::Wide(rid) => {
                0u8.encode_to(buf)?;
                rid.encode_to(buf)
            }
            Token::Cell(key, rid) => {
                1u8.encode_to(buf)?;
                key.encode_to(buf)?;
                rid.encode_to(buf)
            }
            Token::Field(key) => {
                2u8.encode_to(buf)?;
                key.encode_to(buf)
            }
            Token::Range(key, spec) => {
                3u8.encode_to(buf)?;
                key.encode_to(buf)?;
                spec.op.encode_to(buf)?;
                encode_vec(&spec.values, buf)
            }
        }
    }
}

impl Decode for Token {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let token = match tag {
            0 => {
                let (rid, n) = Rid::decode_from(&buf[offset..])?;
                offset += n;
                Token::Wide(rid)
            }
            1 => {
                let (key, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                let (rid, n) = Rid::decode_from(&buf[offset..])?;
                offset += n;
                Token::Cell(key, rid)
            }
            2 => {
                let (key, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                Token::Field(key)
            }
            3 => {
                let (key, n) = String::decode_from(&buf[offset..])?;
                offset += n;
                let (op, n) = Operator::decode_from(&buf[offset..])?;
                offset += n;
                let (values, n) = decode_vec::<Value>(&buf[offset..])?;
                offset += n;
                Token::Range(key, RangeSpec { op, values })
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Token",
                });
            }
        };
        Ok((token, offset))
    }
}

/// The `(operator, values)` payload of a range [`Token`]. Two range tokens
/// are equal (and thus hash-collide for the `LockBroker`'s map) only when
/// they describe the identical operator and bound set — coarsening
/// different range reads into a shared lock entry is the job of
/// [`ValueRange`], not of token equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeSpec {
    pub op: Operator,
    pub values: Vec<Value>,
}

// ------------------------------------------------------------------------------------------------
// ValueRange
// ------------------------------------------------------------------------------------------------

/// One closed interval over [`Value`], using the −∞/+∞-capable
/// [`crate::common::Bound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub lo: crate::common::Bound,
    pub hi: crate::common::Bound,
}

impl Interval {
    pub fn everything() -> Self {
        Self {
            lo: crate::common::Bound::NegInf,
            hi: crate::common::Bound::PosInf,
        }
    }

    pub fn contains_point(&self, value: &Value) -> bool {
        self.lo.admits_as_lower(value) && self.hi.admits_as_upper(value)
    }

    fn overlaps(&self, other: &Interval) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }
}

/// Per-key set of non-overlapping closed intervals over [`Value`], used to
/// coarsen range-read intentions and to detect whether a write range
/// overlaps an already-held read range.
///
/// Write ranges are treated as infinitely wide: they are recorded only to
/// preclude conflicting range reads and never shrink to a concrete
/// interval.
#[derive(Debug, Clone, Default)]
pub struct ValueRange {
    intervals: Vec<Interval>,
}

impl ValueRange {
    pub fn new() -> Self {
        Self { intervals: Vec::new() }
    }

    pub fn everything() -> Self {
        Self {
            intervals: vec![Interval::everything()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Merge `other` into `self`, keeping the union of both coverage sets.
    /// Overlapping/adjacent intervals are not required to collapse for
    /// correctness (containment checks scan the whole vector), so this is a
    /// simple append.
    pub fn merge(&mut self, other: &ValueRange) {
        self.intervals.extend(other.intervals.iter().cloned());
    }

    /// XOR this range's coverage with `other`'s: used when a write
    /// coarsens a prior read-range intention into the write's coverage —
    /// any portion covered by both is removed, the rest is kept. `other`
    /// covering [`Interval::everything`] subsumes every interval in `self`
    /// regardless of its exact bounds; this is the shape the coarsening use
    /// in `AtomicOperation::acquire_locks` always passes, since a write's
    /// range token is infinitely wide (§4.6).
    pub fn xor(&mut self, other: &ValueRange) {
        if other.intervals.iter().any(|o| *o == Interval::everything()) {
            self.intervals.clear();
            return;
        }
        self.intervals
            .retain(|iv| !other.intervals.iter().any(|o| o == iv));
    }

    pub fn contains_point(&self, value: &Value) -> bool {
        self.intervals.iter().any(|iv| iv.contains_point(value))
    }

    pub fn intersects(&self, other: &ValueRange) -> bool {
        self.intervals
            .iter()
            .any(|a| other.intervals.iter().any(|b| a.overlaps(b)))
    }

    /// The coverage one [`RangeSpec`] represents, for coarsening purposes.
    /// Operators with a natural interval shape (`Equals`, `Between`,
    /// `Gt`/`Gte`, `Lt`/`Lte`) get a precise one-interval range; the rest
    /// (regex/contains-family, `NotEquals`) have no interval representation
    /// and conservatively resolve to [`ValueRange::everything`] — an
    /// over-wide read range only costs an extra lock that coarsening could
    /// have dropped, it never drops one that should have stayed locked.
    pub fn from_spec(spec: &RangeSpec) -> Self {
        match spec.op {
            Operator::Equals => match spec.values.first() {
                Some(v) => Self {
                    intervals: vec![Interval {
                        lo: Bound::Included(v.clone()),
                        hi: Bound::Included(v.clone()),
                    }],
                },
                None => Self::everything(),
            },
            Operator::Gt | Operator::Gte => match spec.values.first() {
                Some(v) => Self {
                    intervals: vec![Interval {
                        lo: Bound::Included(v.clone()),
                        hi: Bound::PosInf,
                    }],
                },
                None => Self::everything(),
            },
            Operator::Lt | Operator::Lte => match spec.values.first() {
                Some(v) => Self {
                    intervals: vec![Interval {
                        lo: Bound::NegInf,
                        hi: Bound::Included(v.clone()),
                    }],
                },
                None => Self::everything(),
            },
            Operator::Between => match (spec.values.first(), spec.values.get(1)) {
                (Some(lo), Some(hi)) => Self {
                    intervals: vec![Interval {
                        lo: Bound::Included(lo.clone()),
                        hi: Bound::Included(hi.clone()),
                    }],
                },
                _ => Self::everything(),
            },
            Operator::NotEquals | Operator::Regex | Operator::NotRegex | Operator::Contains | Operator::NotContains => {
                Self::everything()
            }
        }
    }

    /// The coverage one range-read [`Token`] represents: a `Range` token
    /// defers to [`ValueRange::from_spec`]; every other token recorded as a
    /// range-read intention (e.g. `Field`, for a whole-key search) covers
    /// the entire key.
    pub fn from_token(token: &Token) -> Self {
        match token {
            Token::Range(_, spec) => Self::from_spec(spec),
            _ => Self::everything(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// LockBroker
// ------------------------------------------------------------------------------------------------

/// A held lock's mode: multiple readers may share a `Read` entry; a `Write`
/// entry excludes all other holders of the same token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read(u32),
    Write,
}

/// An acquired lock. Dropping (or explicitly releasing via
/// [`LockBroker::release`]) removes the holder's share of the token.
#[derive(Debug)]
pub struct Permit {
    token: Token,
    mode_is_write: bool,
}

impl Permit {
    /// The token this permit was issued for.
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Whether this permit holds a write (exclusive) lock.
    pub fn is_write(&self) -> bool {
        self.mode_is_write
    }
}

/// Issues read/write permits keyed by [`Token`] equality. Read locks allow
/// multiple concurrent holders; write locks exclude all others (including
/// other writers and readers) of the same token.
///
/// `acquireLocks()` only ever calls the non-blocking [`LockBroker::try_read`]
/// / [`LockBroker::try_write`] — there is no blocking variant; commit
/// failures are immediate rather than waiting on a timeout.
#[derive(Debug, Default)]
pub struct LockBroker {
    table: RwLock<HashMap<Token, Mode>>,
}

impl LockBroker {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Attempt to acquire a read lock on `token`. Succeeds if the token is
    /// unlocked or already held in `Read` mode.
    pub fn try_read(&self, token: &Token) -> Result<Permit, LockError> {
        let mut table = self.table.write().map_err(|_| LockError::Internal("poisoned".into()))?;
        match table.get_mut(token) {
            None => {
                table.insert(token.clone(), Mode::Read(1));
            }
            Some(Mode::Read(n)) => {
                *n += 1;
            }
            Some(Mode::Write) => return Err(LockError::WouldBlock(token.clone())),
        }
        trace!(?token, "read lock acquired");
        Ok(Permit {
            token: token.clone(),
            mode_is_write: false,
        })
    }

    /// Attempt to acquire a write lock on `token`. Succeeds only if the
    /// token is currently unlocked.
    pub fn try_write(&self, token: &Token) -> Result<Permit, LockError> {
        let mut table = self.table.write().map_err(|_| LockError::Internal("poisoned".into()))?;
        if table.contains_key(token) {
            return Err(LockError::WouldBlock(token.clone()));
        }
        table.insert(token.clone(), Mode::Write);
        trace!(?token, "write lock acquired");
        Ok(Permit {
            token: token.clone(),
            mode_is_write: true,
        })
    }

    /// A permit that was never really taken: used when a nested
    /// [`crate::atomic::AtomicOperation`] defers all locking to its root
    /// parent's commit.
    pub fn no_op(token: &Token) -> Permit {
        Permit {
            token: token.clone(),
            mode_is_write: false,
        }
    }

    /// Release a previously-acquired permit.
    pub fn release(&self, permit: Permit) {
        let mut table = match self.table.write() {
            Ok(t) => t,
            Err(e) => e.into_inner(),
        };
        match table.get_mut(&permit.token) {
            Some(Mode::Read(n)) if *n > 1 => *n -= 1,
            Some(_) => {
                table.remove(&permit.token);
            }
            None => {}
        }
    }
}

/// Advisory passed by an in-operation caller to let it bypass the durable
/// store's internal locks when it already holds an equivalent guard at the
/// [`crate::atomic::AtomicOperation`] level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locking {
    Default,
    Skip,
}

/// A version-change event broadcast by an [`crate::atomic::AtomicOperation`]-
/// capable store whenever a committed write touches `token`.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    pub token: Token,
}

/// Fan-out announcer: every subscriber gets its own unbounded channel, so a
/// slow subscriber never blocks the announcing writer.
#[derive(Debug, Default)]
pub struct Announcer {
    subscribers: RwLock<Vec<crossbeam::channel::Sender<TokenEvent>>>,
}

impl Announcer {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> crossbeam::channel::Receiver<TokenEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Broadcast that `token`'s version changed. Dead subscribers (their
    /// receiver dropped) are pruned lazily.
    pub fn announce(&self, token: Token) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(TokenEvent { token: token.clone() }).is_ok());
    }
}

pub type SharedAnnouncer = Arc<Announcer>;
