//! Spatial indexing: axis-aligned rectangles of arbitrary dimensionality,
//! their textual form, and an R-tree for intersection queries.

pub mod rect;
pub(crate) mod tree;

pub use rect::{index_rect, point_string, rect_string, Rect};
pub(crate) use tree::SpatialTree;
