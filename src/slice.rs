use serde::{Deserialize, Serialize};
use std::fmt;

/// End marker meaning "through the last element of the axis".
pub const TO_END: i64 = -1;

/// A half-open `[start, end)` range along one tensor axis, serialized as a
/// two element array. An `end` of [`TO_END`] runs to the end of the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[i64; 2]", into = "[i64; 2]")]
pub struct SliceRange {
    pub start: i64,
    pub end: i64,
}

impl SliceRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn full() -> Self {
        Self::new(0, TO_END)
    }

    pub fn single(index: i64) -> Self {
        Self::new(index, index + 1)
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end == TO_END
    }
}

impl From<[i64; 2]> for SliceRange {
    fn from(value: [i64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<SliceRange> for [i64; 2] {
    fn from(value: SliceRange) -> Self {
        [value.start, value.end]
    }
}

/// An ordered list of ranges, one per tensor axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceSpec(pub Vec<SliceRange>);

impl SliceSpec {
    pub fn full(rank: usize) -> Self {
        Self(vec![SliceRange::full(); rank])
    }

    /// Full ranges everywhere except `axis`, which is narrowed to `index`.
    pub fn narrowed(rank: usize, axis: usize, index: i64) -> Self {
        let mut spec = Self::full(rank);
        if let Some(range) = spec.0.get_mut(axis) {
            *range = SliceRange::single(index);
        }
        spec
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn ranges(&self) -> &[SliceRange] {
        &self.0
    }

    /// The canonical string used as the second level key of the intervention
    /// maps. It is the compact JSON rendering of the nested ranges, which is
    /// what the backend receives as the slice name.
    pub fn key(&self) -> SliceKey {
        let mut out = String::from("[");
        for (i, range) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("[{},{}]", range.start, range.end));
        }
        out.push(']');
        SliceKey(out)
    }
}

impl From<Vec<[i64; 2]>> for SliceSpec {
    fn from(value: Vec<[i64; 2]>) -> Self {
        Self(value.into_iter().map(SliceRange::from).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceKey(pub String);

impl SliceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SliceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
