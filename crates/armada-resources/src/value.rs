// Resource value kinds: scalars, ranges and sets
//
// Scalars are fixed-point with three fractional digits; binary floats
// never enter the arithmetic. Ranges are ordered sets of inclusive
// integer intervals, coalesced on every mutation. Sets are unordered
// collections of distinct strings.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Number of fixed-point units per whole value (three fractional digits).
const PRECISION: i64 = 1000;

/// A non-negative fixed-point scalar quantity with millesimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scalar(i64);

impl Scalar {
    /// A scalar holding zero.
    pub const ZERO: Scalar = Scalar(0);

    /// Create a scalar from a whole unit count.
    pub const fn from_units(units: i64) -> Self {
        Scalar(units * PRECISION)
    }

    /// Create a scalar from raw millesimal units.
    pub const fn from_millis(millis: i64) -> Self {
        Scalar(millis)
    }

    /// Raw millesimal units.
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Approximate floating-point view, for display and share math only.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / PRECISION as f64
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Saturating subtraction that never goes below zero.
    pub fn saturating_sub(self, other: Scalar) -> Scalar {
        Scalar((self.0 - other.0).max(0))
    }
}

impl Add for Scalar {
    type Output = Scalar;

    fn add(self, other: Scalar) -> Scalar {
        Scalar(self.0 + other.0)
    }
}

impl AddAssign for Scalar {
    fn add_assign(&mut self, other: Scalar) {
        self.0 += other.0;
    }
}

impl Sub for Scalar {
    type Output = Scalar;

    fn sub(self, other: Scalar) -> Scalar {
        Scalar(self.0 - other.0)
    }
}

impl SubAssign for Scalar {
    fn sub_assign(&mut self, other: Scalar) {
        self.0 -= other.0;
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / PRECISION;
        let frac = (self.0 % PRECISION).abs();
        if frac == 0 {
            write!(f, "{}", whole)
        } else {
            // Trim trailing zeros from the fractional part.
            let mut digits = format!("{:03}", frac);
            while digits.ends_with('0') {
                digits.pop();
            }
            write!(f, "{}.{}", whole, digits)
        }
    }
}

/// An ordered set of inclusive integer intervals.
///
/// Overlapping and adjacent intervals are coalesced, so the internal
/// representation is canonical: sorted, disjoint, non-adjacent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ranges(Vec<(u64, u64)>);

impl Ranges {
    pub fn new(intervals: Vec<(u64, u64)>) -> Self {
        let mut ranges = Ranges(intervals);
        ranges.coalesce();
        ranges
    }

    pub fn intervals(&self) -> &[(u64, u64)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of integers covered.
    pub fn size(&self) -> u64 {
        self.0.iter().map(|(begin, end)| end - begin + 1).sum()
    }

    fn coalesce(&mut self) {
        self.0.retain(|(begin, end)| begin <= end);
        self.0.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.0.len());
        for &(begin, end) in &self.0 {
            match merged.last_mut() {
                // Adjacent intervals merge as well: [1-2] + [3-4] = [1-4].
                Some(last) if begin <= last.1.saturating_add(1) => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((begin, end)),
            }
        }
        self.0 = merged;
    }

    /// Union with another range set.
    pub fn union(&self, other: &Ranges) -> Ranges {
        let mut intervals = self.0.clone();
        intervals.extend_from_slice(&other.0);
        Ranges::new(intervals)
    }

    /// Remove every integer of `other` from this set.
    pub fn difference(&self, other: &Ranges) -> Ranges {
        let mut result: Vec<(u64, u64)> = Vec::new();
        for &(begin, end) in &self.0 {
            let mut cursor = begin;
            for &(obegin, oend) in &other.0 {
                if oend < cursor || obegin > end {
                    continue;
                }
                if obegin > cursor {
                    result.push((cursor, obegin - 1));
                }
                cursor = oend.saturating_add(1);
                if cursor > end {
                    break;
                }
            }
            if cursor <= end {
                result.push((cursor, end));
            }
        }
        Ranges::new(result)
    }

    /// Whether every integer of `other` is present in this set.
    pub fn contains(&self, other: &Ranges) -> bool {
        other.0.iter().all(|&(begin, end)| {
            self.0
                .iter()
                .any(|&(sbegin, send)| sbegin <= begin && end <= send)
        })
    }
}

impl fmt::Display for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (begin, end)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}-{}", begin, end)?;
        }
        write!(f, "]")
    }
}

/// An unordered collection of distinct strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextSet(BTreeSet<String>);

impl TextSet {
    pub fn new(items: impl IntoIterator<Item = String>) -> Self {
        TextSet(items.into_iter().collect())
    }

    pub fn items(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn union(&self, other: &TextSet) -> TextSet {
        TextSet(self.0.union(&other.0).cloned().collect())
    }

    pub fn difference(&self, other: &TextSet) -> TextSet {
        TextSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn contains(&self, other: &TextSet) -> bool {
        other.0.is_subset(&self.0)
    }
}

impl fmt::Display for TextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, "}}")
    }
}

/// The value held by a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// A fixed-point quantity (cpus, mem, disk)
    Scalar(Scalar),
    /// Integer intervals (ports)
    Ranges(Ranges),
    /// Distinct strings (e.g. disk labels)
    Set(TextSet),
}

impl Value {
    /// Kind discriminant, used when matching resources for arithmetic.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Ranges(_) => ValueKind::Ranges,
            Value::Set(_) => ValueKind::Set,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Scalar(scalar) => scalar.is_zero(),
            Value::Ranges(ranges) => ranges.is_empty(),
            Value::Set(set) => set.is_empty(),
        }
    }

    /// Merge another value of the same kind into this one.
    pub(crate) fn merge(&mut self, other: &Value) {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *a += *b,
            (Value::Ranges(a), Value::Ranges(b)) => *a = a.union(b),
            (Value::Set(a), Value::Set(b)) => *a = a.union(b),
            _ => unreachable!("mismatched value kinds are rejected before merging"),
        }
    }

    /// Remove as much of another value as is present, clamping scalars
    /// at zero.
    pub(crate) fn remove_clamped(&mut self, other: &Value) {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *a = a.saturating_sub(*b),
            (Value::Ranges(a), Value::Ranges(b)) => *a = a.difference(b),
            (Value::Set(a), Value::Set(b)) => *a = a.difference(b),
            _ => unreachable!("mismatched value kinds are rejected before removal"),
        }
    }

    /// Remove another value of the same kind from this one.
    pub(crate) fn remove(&mut self, other: &Value) {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *a -= *b,
            (Value::Ranges(a), Value::Ranges(b)) => *a = a.difference(b),
            (Value::Set(a), Value::Set(b)) => *a = a.difference(b),
            _ => unreachable!("mismatched value kinds are rejected before removal"),
        }
    }

    /// Whether this value wholly contains another of the same kind.
    pub(crate) fn contains(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a >= b,
            (Value::Ranges(a), Value::Ranges(b)) => a.contains(b),
            (Value::Set(a), Value::Set(b)) => a.contains(b),
            _ => false,
        }
    }
}

/// Discriminant for [`Value`] kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Scalar,
    Ranges,
    Set,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(scalar) => write!(f, "{}", scalar),
            Value::Ranges(ranges) => write!(f, "{}", ranges),
            Value::Set(set) => write!(f, "{}", set),
        }
    }
}
