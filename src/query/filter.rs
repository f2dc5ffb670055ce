use regex::Regex;
use roaring::RoaringTreemap;
use crate::core::error::Result;
use crate::index::bsi::Operation;
use crate::index::dictionary::content_hash_i64;
use crate::reader::view::View;

/// Narrows a candidate row set within one shard.
pub trait Filter: Send + Sync {
    fn apply(&self, view: &View, found: &RoaringTreemap) -> Result<RoaringTreemap>;
}

/// Built-in predicates over indexed fields.
///
/// A field with no index in the shard has no values there: `Equal` and
/// `Regex` match nothing, their negations keep every candidate.
#[derive(Debug, Clone)]
pub enum Predicate {
    Identity,
    Equal { field: String, value: String },
    NotEqual { field: String, value: String },
    Regex { field: String, pattern: Regex },
    NotRegex { field: String, pattern: Regex },
    /// Inclusive bounds over an int64 index.
    Range { field: String, start: i64, end: i64 },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn equal(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Equal { field: field.into(), value: value.into() }
    }

    pub fn not_equal(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::NotEqual { field: field.into(), value: value.into() }
    }

    pub fn regex(field: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Predicate::Regex { field: field.into(), pattern: Regex::new(pattern)? })
    }

    pub fn not_regex(field: impl Into<String>, pattern: &str) -> Result<Self> {
        Ok(Predicate::NotRegex { field: field.into(), pattern: Regex::new(pattern)? })
    }

    pub fn range(field: impl Into<String>, start: i64, end: i64) -> Self {
        Predicate::Range { field: field.into(), start, end }
    }
}

impl Filter for Predicate {
    fn apply(&self, view: &View, found: &RoaringTreemap) -> Result<RoaringTreemap> {
        match self {
            Predicate::Identity => Ok(found.clone()),
            Predicate::Equal { field, value } => equal(view, field, value, found),
            Predicate::NotEqual { field, value } => Ok(found - &equal(view, field, value, found)?),
            Predicate::Regex { field, pattern } => matching(view, field, pattern, found),
            Predicate::NotRegex { field, pattern } => Ok(found - &matching(view, field, pattern, found)?),
            Predicate::Range { field, start, end } => match view.index(field)? {
                Some(bsi) => Ok(bsi.compare_range(*start, *end, Some(found))),
                None => Ok(RoaringTreemap::new()),
            },
            Predicate::And(predicates) => {
                let mut rows = found.clone();
                for predicate in predicates {
                    if rows.is_empty() {
                        break;
                    }
                    rows = predicate.apply(view, &rows)?;
                }
                Ok(rows)
            }
            Predicate::Or(predicates) => {
                let mut rows = RoaringTreemap::new();
                for predicate in predicates {
                    rows |= predicate.apply(view, found)?;
                }
                Ok(rows)
            }
        }
    }
}

fn equal(view: &View, field: &str, value: &str, found: &RoaringTreemap) -> Result<RoaringTreemap> {
    match view.index(field)? {
        Some(bsi) => Ok(bsi.compare(Operation::Eq, content_hash_i64(field, value), Some(found))),
        None => Ok(RoaringTreemap::new()),
    }
}

// Resolves matching dictionary values, then ORs their equality matches
fn matching(view: &View, field: &str, pattern: &Regex, found: &RoaringTreemap) -> Result<RoaringTreemap> {
    let Some(bsi) = view.index(field)? else {
        return Ok(RoaringTreemap::new());
    };

    let mut rows = RoaringTreemap::new();
    for value in view.dictionary(field)? {
        if pattern.is_match(&value) {
            rows |= bsi.compare(Operation::Eq, content_hash_i64(field, &value), Some(found));
        }
    }
    Ok(rows)
}
