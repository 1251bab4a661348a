//! Multi-dimensional rectangle index.
//!
//! Rectangles carry matched-length `min`/`max` arrays with 1 to 20
//! dimensions. Items ride an R-tree for intersect searches; nearest-first
//! enumeration orders candidates by squared bounding-box distance.

use crate::item::Item;
use rstar::{AABB, Point as RstarPoint, RTree, RTreeObject};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

/// Maximum supported rectangle dimensionality.
pub const MAX_DIMS: usize = 20;

/// An n-dimensional rectangle. `min.len() == max.len()`, dimensions in
/// `1..=20`, and `min[i] <= max[i]`. A point is a rectangle with
/// `min == max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rect {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl Rect {
    /// Build a rectangle, rejecting mismatched or out-of-range shapes.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Option<Self> {
        if min.len() != max.len() || min.is_empty() || min.len() > MAX_DIMS {
            return None;
        }
        for (lo, hi) in min.iter().zip(&max) {
            if !lo.is_finite() || !hi.is_finite() || lo > hi {
                return None;
            }
        }
        Some(Self { min, max })
    }

    /// Build a degenerate point rectangle.
    pub fn point(coords: Vec<f64>) -> Option<Self> {
        Self::new(coords.clone(), coords)
    }

    pub fn dims(&self) -> usize {
        self.min.len()
    }

    /// Parse the textual form `"[min...],[max...]"`, where each bracket
    /// group holds space-separated coordinates. A single group denotes a
    /// point. Returns `None` for anything malformed.
    pub fn parse(input: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(input).ok()?;
        let mut groups: Vec<Vec<f64>> = Vec::with_capacity(2);
        let mut rest = text.trim();
        while !rest.is_empty() {
            let open = rest.find('[')?;
            if !rest[..open]
                .trim_matches(|c: char| c.is_whitespace() || c == ',')
                .is_empty()
            {
                return None;
            }
            let close = rest.find(']')?;
            if close < open {
                return None;
            }
            let coords: Vec<f64> = rest[open + 1..close]
                .split_whitespace()
                .map(|tok| tok.parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .ok()?;
            groups.push(coords);
            rest = rest[close + 1..].trim_start();
        }
        match groups.len() {
            1 => Self::point(groups.pop()?),
            2 => {
                let max = groups.pop()?;
                let min = groups.pop()?;
                Self::new(min, max)
            }
            _ => None,
        }
    }

    /// Squared distance between the bounding boxes of `self` and `other`.
    /// Zero when they overlap; missing dimensions contribute nothing.
    pub fn box_dist(&self, other: &Rect) -> f64 {
        let dims = self.dims().max(other.dims());
        let mut sum = 0.0;
        for i in 0..dims {
            let (a_min, a_max) = (dim_or(&self.min, i), dim_or(&self.max, i));
            let (b_min, b_max) = (dim_or(&other.min, i), dim_or(&other.max, i));
            let d = (b_min - a_max).max(a_min - b_max).max(0.0);
            sum += d * d;
        }
        sum
    }
}

fn dim_or(values: &[f64], i: usize) -> f64 {
    values.get(i).copied().unwrap_or(0.0)
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = |f: &mut fmt::Formatter<'_>, values: &[f64]| -> fmt::Result {
            write!(f, "[")?;
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{v}")?;
            }
            write!(f, "]")
        };
        group(f, &self.min)?;
        if self.min != self.max {
            write!(f, ",")?;
            group(f, &self.max)?;
        }
        Ok(())
    }
}

/// Fixed-arity coordinate for the R-tree; rectangles below 20 dimensions
/// pad with zero, which is neutral for intersection and box distance.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Coord([f64; MAX_DIMS]);

impl RstarPoint for Coord {
    type Scalar = f64;
    const DIMENSIONS: usize = MAX_DIMS;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        Self(std::array::from_fn(|i| generator(i)))
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        self.0[index]
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        &mut self.0[index]
    }
}

fn corner(values: &[f64]) -> Coord {
    Coord(std::array::from_fn(|i| dim_or(values, i)))
}

#[derive(Debug, Clone)]
struct SpatialEntry {
    item: Arc<Item>,
    rect: Rect,
}

impl PartialEq for SpatialEntry {
    fn eq(&self, other: &Self) -> bool {
        self.item.key == other.item.key
    }
}

impl RTreeObject for SpatialEntry {
    type Envelope = AABB<Coord>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(corner(&self.rect.min), corner(&self.rect.max))
    }
}

struct Candidate<'a> {
    entry: &'a SpatialEntry,
    dist: f64,
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}

impl Eq for Candidate<'_> {}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate<'_> {
    // reversed so BinaryHeap pops the nearest candidate first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
    }
}

/// R-tree of items keyed by rectangle.
pub(crate) struct SpatialSet {
    tree: RTree<SpatialEntry>,
}

impl fmt::Debug for SpatialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialSet")
            .field("len", &self.tree.size())
            .finish()
    }
}

impl SpatialSet {
    pub fn new() -> Self {
        Self { tree: RTree::new() }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn insert(&mut self, item: Arc<Item>, rect: Rect) {
        self.tree.insert(SpatialEntry { item, rect });
    }

    pub fn remove(&mut self, item: &Arc<Item>, rect: Rect) -> bool {
        self.tree
            .remove(&SpatialEntry {
                item: item.clone(),
                rect,
            })
            .is_some()
    }

    /// Enumerate items whose rectangles overlap `query`; a falsy callback
    /// stops the search.
    pub fn intersects(&self, query: &Rect, mut f: impl FnMut(&Arc<Item>) -> bool) {
        let envelope = AABB::from_corners(corner(&query.min), corner(&query.max));
        for entry in self.tree.locate_in_envelope_intersecting(&envelope) {
            if !f(&entry.item) {
                return;
            }
        }
    }

    /// Enumerate items nearest-first by squared box distance to `query`; a
    /// falsy callback stops the enumeration.
    pub fn nearby(&self, query: &Rect, mut f: impl FnMut(&Arc<Item>, f64) -> bool) {
        let mut heap = BinaryHeap::with_capacity(self.tree.size());
        for entry in self.tree.iter() {
            heap.push(Candidate {
                entry,
                dist: query.box_dist(&entry.rect),
            });
        }
        while let Some(candidate) = heap.pop() {
            if !f(&candidate.entry.item, candidate.dist) {
                return;
            }
        }
    }
}
