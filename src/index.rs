//! Secondary and spatial index machinery, plus the stock comparators.
//!
//! An index restricts membership with a glob pattern over keys and orders
//! (or spatially organizes) the matching items. Comparators receive item
//! values; the item key is only ever used as a tiebreaker so that every
//! ordering is total.

use crate::config::IndexOptions;
use crate::item::Item;
use crate::ordered::{Comparator, LessFn, OrderedSet};
use crate::pattern;
use crate::spatial::{Rect, SpatialSet};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Extracts the rectangle a value occupies, or `None` when the value has no
/// usable rectangle (the item then stays out of the spatial index).
pub type RectFn = Arc<dyn Fn(&[u8]) -> Option<Rect> + Send + Sync>;

pub(crate) struct Index {
    pub name: String,
    pub pattern: String,
    pub less: Option<LessFn>,
    pub rect: Option<RectFn>,
    pub opts: IndexOptions,
    pub btr: Option<OrderedSet>,
    pub rtr: Option<SpatialSet>,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("less", &self.less.is_some())
            .field("rect", &self.rect.is_some())
            .field("opts", &self.opts)
            .field("btr", &self.btr)
            .field("rtr", &self.rtr)
            .finish()
    }
}

impl Index {
    /// Build an index. Multiple less functions compose lexicographically:
    /// the first non-equal comparator wins, the last breaks remaining ties.
    /// The composite is built once here, not per comparison.
    pub fn new(
        name: &str,
        pattern: String,
        lessers: Vec<LessFn>,
        rect: Option<RectFn>,
        opts: IndexOptions,
    ) -> Self {
        let less = match lessers.len() {
            0 | 1 => lessers.into_iter().next(),
            _ => Some(Arc::new(move |a: &[u8], b: &[u8]| {
                for less in &lessers[..lessers.len() - 1] {
                    if less(a, b) {
                        return true;
                    }
                    if less(b, a) {
                        return false;
                    }
                }
                lessers[lessers.len() - 1](a, b)
            }) as LessFn),
        };

        let btr = less
            .as_ref()
            .map(|less| OrderedSet::new(Comparator::Less(less.clone())));
        let rtr = rect.as_ref().map(|_| SpatialSet::new());

        Self {
            name: name.to_string(),
            pattern,
            less,
            rect,
            opts,
            btr,
            rtr,
        }
    }

    /// Whether `key` participates in this index.
    pub fn matches(&self, key: &[u8]) -> bool {
        if self.pattern == "*" {
            return true;
        }
        if self.opts.case_insensitive_key_matching {
            pattern::matches(&key.to_ascii_lowercase(), self.pattern.as_bytes())
        } else {
            pattern::matches(key, self.pattern.as_bytes())
        }
    }

    /// A copy of this index with the same shape and no data, used for
    /// rollback journaling and `delete_all`.
    pub fn clear_copy(&self) -> Index {
        Index {
            name: self.name.clone(),
            pattern: self.pattern.clone(),
            less: self.less.clone(),
            rect: self.rect.clone(),
            opts: self.opts,
            btr: self
                .less
                .as_ref()
                .map(|less| OrderedSet::new(Comparator::Less(less.clone()))),
            rtr: self.rect.as_ref().map(|_| SpatialSet::new()),
        }
    }

    /// Insert a matching item into the index structures.
    pub fn insert(&mut self, item: &Arc<Item>) {
        if let Some(btr) = &mut self.btr {
            btr.insert(item.clone());
        }
        if let (Some(rtr), Some(rect_fn)) = (&mut self.rtr, &self.rect)
            && let Some(rect) = rect_fn(&item.value)
        {
            rtr.insert(item.clone(), rect);
        }
    }

    /// Remove an item from the index structures. The spatial rectangle is
    /// recomputed from the stored value, which is deterministic.
    pub fn remove(&mut self, item: &Arc<Item>) {
        if let Some(btr) = &mut self.btr {
            btr.remove(item);
        }
        if let (Some(rtr), Some(rect_fn)) = (&mut self.rtr, &self.rect)
            && let Some(rect) = rect_fn(&item.value)
        {
            rtr.remove(item, rect);
        }
    }

    /// Drop all data and reinsert every matching item from the primary tree.
    pub fn rebuild(&mut self, keys: &OrderedSet) {
        if let Some(btr) = &mut self.btr {
            btr.clear();
        }
        if self.rtr.is_some() {
            self.rtr = Some(SpatialSet::new());
        }
        let mut matching = Vec::new();
        keys.ascend(None, |item| {
            if self.matches(&item.key) {
                matching.push(item.clone());
            }
            true
        });
        for item in matching {
            self.insert(&item);
        }
    }
}

/// Case-sensitive byte comparison of values.
pub fn index_binary() -> LessFn {
    Arc::new(|a, b| a < b)
}

/// Case-insensitive comparison (ASCII folding), like comparing lowercased
/// copies without allocating them.
pub fn index_string() -> LessFn {
    Arc::new(|a, b| {
        for (x, y) in a.iter().zip(b.iter()) {
            let (x, y) = (x.to_ascii_lowercase(), y.to_ascii_lowercase());
            if x < y {
                return true;
            }
            if x > y {
                return false;
            }
        }
        a.len() < b.len()
    })
}

/// Compares values as signed integers; unparseable values count as zero.
pub fn index_int() -> LessFn {
    Arc::new(|a, b| parse_num::<i64>(a) < parse_num::<i64>(b))
}

/// Compares values as unsigned integers; unparseable values count as zero.
pub fn index_uint() -> LessFn {
    Arc::new(|a, b| parse_num::<u64>(a) < parse_num::<u64>(b))
}

/// Compares values as floats; unparseable values count as zero.
pub fn index_float() -> LessFn {
    Arc::new(|a, b| parse_num::<f64>(a) < parse_num::<f64>(b))
}

fn parse_num<T: std::str::FromStr + Default>(v: &[u8]) -> T {
    std::str::from_utf8(v)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or_default()
}

/// Reverses the order of another comparator.
pub fn desc(less: LessFn) -> LessFn {
    Arc::new(move |a, b| less(b, a))
}

/// Orders values by a JSON field addressed with a dotted path, for example
/// `"user.name"`. String comparison is case-insensitive.
pub fn index_json(path: &str) -> LessFn {
    let pointer = dotted_to_pointer(path);
    Arc::new(move |a, b| json_less(&json_field(a, &pointer), &json_field(b, &pointer), false))
}

/// Like [`index_json`] with case-sensitive string comparison.
pub fn index_json_case_sensitive(path: &str) -> LessFn {
    let pointer = dotted_to_pointer(path);
    Arc::new(move |a, b| json_less(&json_field(a, &pointer), &json_field(b, &pointer), true))
}

/// Parses values in the `"[min],[max]"` textual rectangle form.
pub fn index_rect() -> RectFn {
    Arc::new(|value| Rect::parse(value))
}

fn dotted_to_pointer(path: &str) -> String {
    let mut pointer = String::with_capacity(path.len() + 1);
    for part in path.split('.') {
        pointer.push('/');
        pointer.push_str(&part.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

fn json_field(value: &[u8], pointer: &str) -> Value {
    serde_json::from_slice::<Value>(value)
        .ok()
        .and_then(|v| v.pointer(pointer).cloned())
        .unwrap_or(Value::Null)
}

// Values of different kinds order by kind: null < false < number < string
// < true < arrays/objects.
fn json_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Bool(true) => 4,
        _ => 5,
    }
}

fn json_less(a: &Value, b: &Value, case_sensitive: bool) -> bool {
    let (ra, rb) = (json_rank(a), json_rank(b));
    if ra != rb {
        return ra < rb;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().unwrap_or(0.0) < y.as_f64().unwrap_or(0.0)
        }
        (Value::String(x), Value::String(y)) => {
            if case_sensitive {
                x < y
            } else {
                x.to_lowercase() < y.to_lowercase()
            }
        }
        _ => a.to_string() < b.to_string(),
    }
}
