/// Point cloud coordinate bounds tracking and normalisation
use serde::{Deserialize, Serialize};

use crate::header::LasHeader;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointCloudBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl PointCloudBounds {
    /// Create new bounds initialised to infinity values
    pub fn new() -> Self {
        Self {
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            min_y: f64::INFINITY,
            max_y: f64::NEG_INFINITY,
            min_z: f64::INFINITY,
            max_z: f64::NEG_INFINITY,
        }
    }

    /// Update bounds with a new point
    pub fn update(&mut self, x: f64, y: f64, z: f64) {
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
        self.min_z = self.min_z.min(z);
        self.max_z = self.max_z.max(z);
    }

    /// Grow the bounds to cover the min/max extents declared by a file header.
    pub fn include_header(&mut self, header: &LasHeader) {
        self.update(header.min_x, header.min_y, header.min_z);
        self.update(header.max_x, header.max_y, header.max_z);
    }

    /// Get world space dimensions
    pub fn dimensions(&self) -> (f64, f64, f64) {
        (
            self.max_x - self.min_x,
            self.max_y - self.min_y,
            self.max_z - self.min_z,
        )
    }

    /// The largest of the three axis spans. Normalisation divides every axis
    /// by this single span so that aspect ratio is preserved.
    pub fn largest_span(&self) -> f64 {
        let (dx, dy, dz) = self.dimensions();
        dx.max(dy).max(dz)
    }

    /// Normalise a world coordinate into the canonical unit cube, roughly
    /// [-1, 1] on the widest axis and a subrange on the narrower ones.
    /// Requires a positive largest span; callers reject degenerate extents
    /// before normalising.
    pub fn normalize(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64) {
        let span = self.largest_span();
        (
            ((x - self.min_x) / span - 0.5) * 2.0,
            ((y - self.min_y) / span - 0.5) * 2.0,
            ((z - self.min_z) / span - 0.5) * 2.0,
        )
    }

    /// True once at least one update has been applied per axis.
    pub fn is_finite(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y && self.min_z <= self.max_z
    }
}

impl Default for PointCloudBounds {
    fn default() -> Self {
        Self::new()
    }
}
