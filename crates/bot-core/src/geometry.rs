use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel coordinates (x1, y1) top-left, (x2, y2) bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(1.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(1.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (0.5 * (self.x1 + self.x2), 0.5 * (self.y1 + self.y2))
    }

    pub fn center_y(&self) -> f32 {
        0.5 * (self.y1 + self.y2)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// True when `inner` lies within `self`, allowing `pad` pixels of slack on each edge.
    pub fn contains(&self, inner: &BBox, pad: f32) -> bool {
        inner.x1 >= self.x1 - pad
            && inner.y1 >= self.y1 - pad
            && inner.x2 <= self.x2 + pad
            && inner.y2 <= self.y2 + pad
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    /// Intersection area divided by the area of `self`.
    pub fn overlap_ratio(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        if ix2 <= ix1 || iy2 <= iy1 {
            return 0.0;
        }
        ((ix2 - ix1) * (iy2 - iy1)) / self.area()
    }

    /// Shifted copy; used to counter scroll inertia by clicking above center.
    pub fn shifted(&self, dx: f32, dy: f32) -> BBox {
        BBox::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    /// Integer key for ROI-level caches.
    pub fn cache_key(&self) -> (i32, i32, i32, i32) {
        (
            self.x1 as i32,
            self.y1 as i32,
            self.x2 as i32,
            self.y2 as i32,
        )
    }
}
