//! [`Record`] — the in-memory materialized view of all (or one key's)
//! revisions for a locator, built by appending Revisions seeked out of
//! [`crate::block::Block`]s and/or a Limbo fold.
//!
//! Folds ordered revisions into present/history maps; the Secondary
//! `explore`/`gather` and Search infix-matching algorithms build on top of
//! that same fold.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::block::{self, Key, Locator, Orientation, SortValue};
use crate::common::{Action, Operator, Rid, Value, Version};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("revision locator {0:?} does not match record locator {1:?}")]
    LocatorMismatch(Locator, Locator),
    #[error("revision key {0:?} does not match this record's partial key {1:?}")]
    KeyMismatch(Key, Key),
    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),
}

/// An in-memory materialization of every Revision seeked for one locator
/// (optionally narrowed to a single key, making the Record "partial").
#[derive(Debug, Clone)]
pub struct Record {
    orientation: Orientation,
    locator: Locator,
    partial_key: Option<Key>,
    present: HashMap<Key, Vec<SortValue>>,
    history: HashMap<Key, Vec<(Version, Action, SortValue)>>,
}

impl Record {
    pub fn new(orientation: Orientation, locator: Locator) -> Self {
        Self {
            orientation,
            locator,
            partial_key: None,
            present: HashMap::new(),
            history: HashMap::new(),
        }
    }

    /// A partial Record narrowed to a single key — every appended revision
    /// must carry this exact key (Search is exempt: its "key" column is the
    /// query term, which legitimately varies per append).
    pub fn partial(orientation: Orientation, locator: Locator, key: Key) -> Self {
        Self {
            orientation,
            locator,
            partial_key: Some(key),
            present: HashMap::new(),
            history: HashMap::new(),
        }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn is_empty(&self) -> bool {
        self.history.values().all(|h| h.is_empty())
    }

    /// Append one revision, silently discarding it if it fails to *offset*
    /// the currently-observed state (ADD only if absent, REMOVE only if
    /// present) — non-offsetting revisions signal double-apply from backup
    /// recovery (CON-83) and must be dropped rather than corrupt
    /// `present`.
    ///
    /// Panics are never used for the locator/partial-key invariants here:
    /// callers (Block::seek, Database::accept) only ever construct a
    /// Record whose locator matches what they're about to seek, so a
    /// mismatch indicates a programming error upstream, not bad input —
    /// `try_append` is the fallible entry point for callers that cannot
    /// make that guarantee.
    pub fn append(&mut self, revision: block::Revision) {
        let _ = self.try_append(revision);
    }

    pub fn try_append(&mut self, revision: block::Revision) -> Result<(), RecordError> {
        if revision.locator != self.locator {
            return Err(RecordError::LocatorMismatch(revision.locator, self.locator.clone()));
        }
        if self.orientation != Orientation::Search {
            if let Some(pk) = &self.partial_key {
                if &revision.key != pk {
                    return Err(RecordError::KeyMismatch(revision.key, pk.clone()));
                }
            }
        }

        let currently_present = self
            .present
            .get(&revision.key)
            .is_some_and(|vs| vs.contains(&revision.value));

        let offsets = match revision.action {
            Action::Add => !currently_present,
            Action::Remove => currently_present,
            Action::Compare => false,
        };

        self.history
            .entry(revision.key.clone())
            .or_default()
            .push((revision.version, revision.action, revision.value.clone()));

        if offsets {
            let bucket = self.present.entry(revision.key).or_default();
            match revision.action {
                Action::Add => bucket.push(revision.value),
                Action::Remove => bucket.retain(|v| v != &revision.value),
                Action::Compare => {}
            }
        }

        Ok(())
    }

    /// An unmodifiable view of `present[k]`, or empty if absent.
    pub fn get(&self, k: &Key) -> Vec<SortValue> {
        self.present.get(k).cloned().unwrap_or_default()
    }

    /// Fold `history[k]` up to and including `ts`.
    pub fn get_at(&self, k: &Key, ts: Version) -> Vec<SortValue> {
        let mut set: Vec<SortValue> = Vec::new();
        if let Some(h) = self.history.get(k) {
            for (version, action, value) in h {
                if *version > ts {
                    continue;
                }
                match action {
                    Action::Add => {
                        if !set.contains(value) {
                            set.push(value.clone());
                        }
                    }
                    Action::Remove => set.retain(|v| v != value),
                    Action::Compare => {}
                }
            }
        }
        set
    }

    /// All keys this record currently holds at least one value under.
    pub fn present_keys(&self) -> impl Iterator<Item = &Key> {
        self.present.iter().filter(|(_, v)| !v.is_empty()).map(|(k, _)| k)
    }

    /// Every key this record has ever had a revision for, present or not —
    /// the superset `present_keys()` narrows to currently-nonempty values.
    pub fn history_keys(&self) -> impl Iterator<Item = &Key> {
        self.history.keys()
    }

    pub fn history_of(&self, k: &Key) -> Vec<(Version, Action, SortValue)> {
        self.history.get(k).cloned().unwrap_or_default()
    }

    // --------------------------------------------------------------------
    // Secondary: explore
    // --------------------------------------------------------------------

    /// Secondary `explore`: test every `(value, rid)` pair present in this
    /// (Secondary, locator=field-key) record against `op`/`operands`,
    /// returning every matching `rid` with the set of its matching values.
    /// String comparisons are case-insensitive; order operators fold the
    /// bound's case per CON-667 before comparing.
    pub fn explore(&self, op: Operator, operands: &[Value]) -> Result<HashMap<Rid, HashSet<Value>>, RecordError> {
        debug_assert_eq!(self.orientation, Orientation::Secondary);
        let mut out: HashMap<Rid, HashSet<Value>> = HashMap::new();
        for (key, rids) in &self.present {
            let Key::Value(value) = key else { continue };
            if rids.is_empty() {
                continue;
            }
            if matches_operator(value, op, operands)? {
                for sv in rids {
                    if let SortValue::Rid(rid) = sv {
                        out.entry(*rid).or_default().insert(value.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    // --------------------------------------------------------------------
    // Search: infix query
    // --------------------------------------------------------------------

    /// Search over a multi-word query: tokenize, discard stopwords
    /// (tracking the count of skipped tokens as an offset), and intersect
    /// candidate term positions so that term `i+1+offset` follows term `i`.
    /// RIDs surviving every term are returned.
    pub fn search(&self, query: &str) -> HashSet<Rid> {
        debug_assert_eq!(self.orientation, Orientation::Search);
        let terms = query_terms(query);
        if terms.is_empty() {
            return HashSet::new();
        }

        let mut candidates: Option<HashMap<Rid, Vec<u32>>> = None;
        for (delta, term) in &terms {
            let positions = self.get(&Key::Text(term.clone()));
            let mut by_rid: HashMap<Rid, Vec<u32>> = HashMap::new();
            for sv in positions {
                if let SortValue::Position(p) = sv {
                    by_rid.entry(p.rid).or_default().push(p.pos);
                }
            }

            candidates = Some(match candidates {
                None => by_rid,
                Some(prev) => {
                    let mut next: HashMap<Rid, Vec<u32>> = HashMap::new();
                    for (rid, prev_positions) in prev {
                        if let Some(cur_positions) = by_rid.get(&rid) {
                            let matched: Vec<u32> = cur_positions
                                .iter()
                                .copied()
                                .filter(|&p| prev_positions.iter().any(|&pp| p == pp + *delta as u32))
                                .collect();
                            if !matched.is_empty() {
                                next.insert(rid, matched);
                            }
                        }
                    }
                    next
                }
            });
        }

        candidates.unwrap_or_default().into_keys().collect()
    }
}

/// Tokenize a query into `(delta, term)` pairs, where `delta` is the
/// positional distance from the previous kept term (1 for adjacent terms,
/// more when stopwords were skipped between them).
fn query_terms(query: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut delta = 1usize;
    for (i, word) in query.split_whitespace().enumerate() {
        let lower = word.to_lowercase();
        if block::STOPWORDS.contains(&lower.as_str()) {
            delta += 1;
            continue;
        }
        out.push((if i == 0 { 0 } else { delta }, lower));
        delta = 1;
    }
    out
}

/// Apply a Secondary `explore` operator to one stored value against its
/// bound operand(s). `NOT_CONTAINS` is strictly "not in": no early-exit
/// special case that would also admit a true "contains" match.
fn matches_operator(value: &Value, op: Operator, operands: &[Value]) -> Result<bool, RecordError> {
    use Operator::*;
    match op {
        Equals => Ok(operands.first().is_some_and(|b| value.eq_case_insensitive(b))),
        NotEquals => Ok(operands.first().is_none_or(|b| !value.eq_case_insensitive(b))),
        Gt => Ok(operands.first().is_some_and(|b| *value > folded(value, b, Gt))),
        Gte => Ok(operands.first().is_some_and(|b| *value >= folded(value, b, Gte))),
        Lt => Ok(operands.first().is_some_and(|b| *value < folded(value, b, Lt))),
        Lte => Ok(operands.first().is_some_and(|b| *value <= folded(value, b, Lte))),
        Between => {
            if operands.len() < 2 {
                return Ok(false);
            }
            let lo = folded(value, &operands[0], Gte);
            let hi = folded(value, &operands[1], Lte);
            Ok(*value >= lo && *value <= hi)
        }
        Regex | NotRegex => {
            let Some(Value::Str(pattern)) = operands.first() else {
                return Ok(false);
            };
            let re = regex::Regex::new(pattern).map_err(|e| RecordError::InvalidRegex(e.to_string()))?;
            let is_match = re.is_match(&value.as_text());
            Ok(if op == Regex { is_match } else { !is_match })
        }
        Contains => Ok(operands.first().is_some_and(|b| {
            value
                .as_text()
                .to_lowercase()
                .contains(&b.as_text().to_lowercase())
        })),
        NotContains => Ok(!operands.first().is_some_and(|b| {
            value
                .as_text()
                .to_lowercase()
                .contains(&b.as_text().to_lowercase())
        })),
    }
}

/// CON-667: fold a range bound's case (for string-like values) before
/// comparing, per the direction-dependent mapping in
/// [`Value::fold_bound_for_operator`].
fn folded(stored: &Value, bound: &Value, op: Operator) -> Value {
    let _ = stored;
    bound.fold_bound_for_operator(op)
}
