use itertools::Itertools as _;

/// An axis-aligned bounding box. `min` and `max` normally have the same
/// length; a dimension missing from either side is treated as unbounded,
/// which conservatively widens rectangles of mixed dimensionality.
#[derive(Clone, Debug, PartialEq)]
pub struct Rect {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl Rect {
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Self {
        Self { min, max }
    }

    /// A degenerate rectangle covering a single point.
    pub fn point(coords: Vec<f64>) -> Self {
        Self {
            min: coords.clone(),
            max: coords,
        }
    }

    pub fn dims(&self) -> usize {
        self.min.len().max(self.max.len())
    }

    fn axis(&self, dim: usize) -> (f64, f64) {
        (
            self.min.get(dim).copied().unwrap_or(f64::NEG_INFINITY),
            self.max.get(dim).copied().unwrap_or(f64::INFINITY),
        )
    }

    /// Inclusive intersection test on every axis.
    pub fn intersects(&self, other: &Rect) -> bool {
        for dim in 0..self.dims().max(other.dims()) {
            let (amin, amax) = self.axis(dim);
            let (bmin, bmax) = other.axis(dim);
            if amin > bmax || amax < bmin {
                return false;
            }
        }
        true
    }

    /// Grows this rectangle to cover `other`.
    pub fn expand(&mut self, other: &Rect) {
        let dims = self.dims().max(other.dims());
        let mut min = Vec::with_capacity(dims);
        let mut max = Vec::with_capacity(dims);
        for dim in 0..dims {
            let (amin, amax) = self.axis(dim);
            let (bmin, bmax) = other.axis(dim);
            min.push(amin.min(bmin));
            max.push(amax.max(bmax));
        }
        self.min = min;
        self.max = max;
    }

    /// The volume of the box, used to pick insertion subtrees. Degenerate
    /// boxes have zero volume; unbounded axes make it infinite.
    pub fn volume(&self) -> f64 {
        let mut volume = 1.0;
        for dim in 0..self.dims() {
            let (min, max) = self.axis(dim);
            volume *= max - min;
        }
        volume
    }

    /// How much this rectangle's volume would grow to cover `other`.
    pub fn enlargement(&self, other: &Rect) -> f64 {
        let mut grown = self.clone();
        grown.expand(other);
        grown.volume() - self.volume()
    }
}

/// Parses the textual rectangle form: `"[a b c]"` for a point,
/// `"[a b],[c d]"` for a box. Returns `(None, None)` for empty input and a
/// `None` max when only one bracket group is present; groups past the
/// second are ignored. Unparsable coordinates read as zero.
pub fn index_rect(text: &str) -> (Option<Vec<f64>>, Option<Vec<f64>>) {
    let mut min = None;
    let mut max = None;
    for (i, group) in text.split(',').take(2).enumerate() {
        if group.len() < 2 || !group.starts_with('[') || !group.ends_with(']') {
            continue;
        }
        let coords: Vec<f64> = group[1..group.len() - 1]
            .split(' ')
            .filter(|piece| !piece.is_empty())
            .map(|piece| piece.parse().unwrap_or(0.0))
            .collect();
        if i == 0 {
            min = Some(coords);
        } else {
            max = Some(coords);
        }
    }
    (min, max)
}

/// Formats a min/max pair back into the textual rectangle form. When the
/// two corners are equal the point form is produced, so output round-trips
/// through [`index_rect`].
pub fn rect_string(min: Option<&[f64]>, max: Option<&[f64]>) -> String {
    if min.is_none() && max.is_none() {
        return String::new();
    }
    let min = min.unwrap_or_default();
    // A missing max means the rect is a point equal to min.
    let max = max.unwrap_or(min);
    let mut text = format!("[{}]", min.iter().join(" "));
    if min != max {
        text.push_str(&format!(",[{}]", max.iter().join(" ")));
    }
    text
}

/// Formats a point, e.g. `point_string(&[1.0, 2.0, 3.0])` is `"[1 2 3]"`.
pub fn point_string(coords: &[f64]) -> String {
    format!("[{}]", coords.iter().join(" "))
}
