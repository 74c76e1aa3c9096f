//! Named secondary indexes. An index scopes its membership with a wildcard
//! key pattern and orders members either by a user comparator over values
//! (ordered index) or by rectangles parsed from values (spatial index). An
//! index created without a comparator or extractor is accepted but holds no
//! container; scans over it visit nothing.

use std::sync::Arc;

use crate::item::Item;
use crate::ordered::{Comparator, OrderedSet};
use crate::pattern::wildcard_match;
use crate::spatial::{Rect, SpatialTree};

/// A comparator over item values: returns whether `a` sorts before `b`.
pub type LessFn = fn(&str, &str) -> bool;

/// Extracts a rectangle from an item value, as `(min, max)` corners.
pub type RectFn = fn(&str) -> (Option<Vec<f64>>, Option<Vec<f64>>);

/// Case-insensitive lexical order.
pub fn index_string(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    for i in 0..a.len().min(b.len()) {
        let (ca, cb) = (a[i].to_ascii_lowercase(), b[i].to_ascii_lowercase());
        if ca != cb {
            return ca < cb;
        }
    }
    a.len() < b.len()
}

/// Byte-wise lexical order.
pub fn index_binary(a: &str, b: &str) -> bool {
    a < b
}

/// Signed integer order. Unparsable values read as zero.
pub fn index_int(a: &str, b: &str) -> bool {
    a.parse::<i64>().unwrap_or(0) < b.parse::<i64>().unwrap_or(0)
}

/// Unsigned integer order. Unparsable values read as zero.
pub fn index_uint(a: &str, b: &str) -> bool {
    a.parse::<u64>().unwrap_or(0) < b.parse::<u64>().unwrap_or(0)
}

/// Floating point order. Unparsable values read as zero.
pub fn index_float(a: &str, b: &str) -> bool {
    a.parse::<f64>().unwrap_or(0.0) < b.parse::<f64>().unwrap_or(0.0)
}

pub(crate) struct Index {
    pub name: String,
    pub pattern: String,
    rect: Option<RectFn>,
    pub set: Option<OrderedSet>,
    pub tree: Option<SpatialTree>,
}

impl Index {
    pub fn ordered(name: &str, pattern: &str, less: Option<LessFn>) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            rect: None,
            set: less.map(|less| OrderedSet::new(Comparator::Values(less))),
            tree: None,
        }
    }

    pub fn spatial(name: &str, pattern: &str, rect: Option<RectFn>) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            rect,
            set: None,
            tree: rect.map(|_| SpatialTree::new()),
        }
    }

    /// Whether an item with `key` belongs to this index. An empty pattern
    /// at this level means match-all.
    pub fn matches(&self, key: &str) -> bool {
        self.pattern.is_empty() || self.pattern == "*" || wildcard_match(key, &self.pattern)
    }

    /// The rectangle this index derives from `value`, if it is a spatial
    /// index and the value parses as one.
    fn item_rect(&self, value: &str) -> Option<Rect> {
        let (min, max) = (self.rect?)(value);
        let min = min?;
        let max = max.unwrap_or_else(|| min.clone());
        Some(Rect::new(min, max))
    }

    /// Adds an item that matched the pattern to this index's container.
    pub fn insert(&mut self, item: &Arc<Item>) {
        if let Some(set) = &mut self.set {
            set.insert(item.clone());
        }
        if let Some(rect) = self.item_rect(&item.value) {
            if let Some(tree) = &mut self.tree {
                tree.insert(rect, item.clone());
            }
        }
    }

    /// Removes an item from this index's container. Rectangles are
    /// recomputed from the value; extractors are pure.
    pub fn remove(&mut self, item: &Arc<Item>) {
        if let Some(set) = &mut self.set {
            set.remove(item);
        }
        if let Some(rect) = self.item_rect(&item.value) {
            if let Some(tree) = &mut self.tree {
                tree.remove(&rect, &item.key);
            }
        }
    }
}
