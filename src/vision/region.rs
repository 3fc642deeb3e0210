//! Screen rectangles and the match containment rule.

use serde::{Deserialize, Serialize};

/// A point in absolute screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: i32,
    /// Vertical coordinate.
    pub y: i32,
}

/// Screen rectangle `[x1, x2) x [y1, y2)` with `x2 > x1` and `y2 > y1`.
///
/// Used both as the capture bound and as the containment test for
/// matches: a match is accepted only if its whole bounding box lies
/// inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRegion", into = "RawRegion")]
pub struct Region {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegion {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

impl TryFrom<RawRegion> for Region {
    type Error = String;

    fn try_from(raw: RawRegion) -> Result<Self, Self::Error> {
        Self::new(raw.x1, raw.y1, raw.x2, raw.y2).ok_or_else(|| {
            format!(
                "region ({}, {}, {}, {}) must have x2 > x1 and y2 > y1",
                raw.x1, raw.y1, raw.x2, raw.y2
            )
        })
    }
}

impl From<Region> for RawRegion {
    fn from(r: Region) -> Self {
        Self {
            x1: r.x1,
            y1: r.y1,
            x2: r.x2,
            y2: r.y2,
        }
    }
}

impl Region {
    /// Creates a region, returning `None` unless it has positive width
    /// and height.
    #[must_use]
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Option<Self> {
        if x2 > x1 && y2 > y1 {
            Some(Self { x1, y1, x2, y2 })
        } else {
            None
        }
    }

    /// Creates a region from an origin and a size.
    #[must_use]
    pub fn from_origin_size(x: i32, y: i32, width: u32, height: u32) -> Option<Self> {
        let w = i32::try_from(width).ok()?;
        let h = i32::try_from(height).ok()?;
        Self::new(x, y, x.checked_add(w)?, y.checked_add(h)?)
    }

    /// Left edge.
    #[must_use]
    pub const fn x1(&self) -> i32 {
        self.x1
    }

    /// Top edge.
    #[must_use]
    pub const fn y1(&self) -> i32 {
        self.y1
    }

    /// Right edge (exclusive).
    #[must_use]
    pub const fn x2(&self) -> i32 {
        self.x2
    }

    /// Bottom edge (exclusive).
    #[must_use]
    pub const fn y2(&self) -> i32 {
        self.y2
    }

    /// Width in pixels.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn width(&self) -> u32 {
        (self.x2 - self.x1) as u32
    }

    /// Height in pixels.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn height(&self) -> u32 {
        (self.y2 - self.y1) as u32
    }

    /// Returns `true` if every edge of `bbox` lies inside this region.
    #[must_use]
    pub const fn contains(&self, bbox: &BoundingBox) -> bool {
        bbox.left >= self.x1 && bbox.top >= self.y1 && bbox.right <= self.x2 && bbox.bottom <= self.y2
    }

    /// Translates a box found at `(x, y)` inside a capture of this region
    /// into absolute screen coordinates.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn to_screen(&self, x: u32, y: u32, width: u32, height: u32) -> BoundingBox {
        let left = self.x1 + x as i32;
        let top = self.y1 + y as i32;
        BoundingBox {
            left,
            top,
            right: left + width as i32,
            bottom: top + height as i32,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// Matched area in absolute screen coordinates; `right`/`bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge.
    pub left: i32,
    /// Top edge.
    pub top: i32,
    /// Right edge (exclusive).
    pub right: i32,
    /// Bottom edge (exclusive).
    pub bottom: i32,
}

impl BoundingBox {
    /// Centre of the box, rounding toward the top-left.
    #[must_use]
    pub const fn center(&self) -> Point {
        Point {
            x: self.left + (self.right - self.left) / 2,
            y: self.top + (self.bottom - self.top) / 2,
        }
    }
}
