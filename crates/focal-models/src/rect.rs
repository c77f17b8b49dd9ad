//! Axis-aligned rectangles in pixel space.

use serde::{Deserialize, Serialize};

/// Rectangle in pixel coordinates of the orientation-corrected image.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge x-coordinate
    pub x: f64,
    /// Top edge y-coordinate
    pub y: f64,
    /// Rectangle width
    pub width: f64,
    /// Rectangle height
    pub height: f64,
}

impl Rect {
    /// Create a new rectangle.
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Build from corner coordinates.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            width: (x2 - x1).abs(),
            height: (y2 - y1).abs(),
        }
    }

    /// Build a rectangle of the given size centered on `(cx, cy)`.
    pub fn centered(cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self {
            x: cx - width / 2.0,
            y: cy - height / 2.0,
            width,
            height,
        }
    }

    /// Center x-coordinate.
    #[inline]
    pub fn cx(&self) -> f64 {
        self.x + self.width / 2.0
    }

    /// Center y-coordinate.
    #[inline]
    pub fn cy(&self) -> f64 {
        self.y + self.height / 2.0
    }

    /// Right edge x-coordinate.
    #[inline]
    pub fn x2(&self) -> f64 {
        self.x + self.width
    }

    /// Bottom edge y-coordinate.
    #[inline]
    pub fn y2(&self) -> f64 {
        self.y + self.height
    }

    /// Area in square pixels.
    #[inline]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// True when the rectangle has no area.
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Overlapping region of two rectangles, if any.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
    }

    /// Compute Intersection over Union with another rectangle.
    pub fn iou(&self, other: &Rect) -> f64 {
        let Some(overlap) = self.intersection(other) else {
            return 0.0;
        };

        let intersection = overlap.area();
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Smallest rectangle containing every input rectangle.
    pub fn union(rects: &[Rect]) -> Option<Rect> {
        if rects.is_empty() {
            return None;
        }

        let x = rects.iter().map(|r| r.x).fold(f64::INFINITY, f64::min);
        let y = rects.iter().map(|r| r.y).fold(f64::INFINITY, f64::min);
        let x2 = rects.iter().map(|r| r.x2()).fold(f64::NEG_INFINITY, f64::max);
        let y2 = rects.iter().map(|r| r.y2()).fold(f64::NEG_INFINITY, f64::max);

        Some(Rect::new(x, y, x2 - x, y2 - y))
    }

    /// Return a new rectangle grown by `padding` pixels on all sides.
    pub fn pad(&self, padding: f64) -> Rect {
        Rect {
            x: self.x - padding,
            y: self.y - padding,
            width: self.width + 2.0 * padding,
            height: self.height + 2.0 * padding,
        }
    }

    /// Scale every coordinate by `factor` (e.g. working image -> source image).
    pub fn scale(&self, factor: f64) -> Rect {
        Rect {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
        }
    }

    /// Crop the rectangle to the image bounds.
    pub fn clip_to(&self, width: f64, height: f64) -> Rect {
        let x1 = self.x.clamp(0.0, width);
        let y1 = self.y.clamp(0.0, height);
        let x2 = self.x2().clamp(0.0, width);
        let y2 = self.y2().clamp(0.0, height);
        Rect::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
    }

    /// Shift the rectangle inside `bounds` without resizing it when possible.
    ///
    /// Rectangles larger than `bounds` are shrunk to fit.
    pub fn shift_into(&self, bounds: &Rect) -> Rect {
        let width = self.width.min(bounds.width);
        let height = self.height.min(bounds.height);
        let x = self.x.max(bounds.x).min(bounds.x2() - width);
        let y = self.y.max(bounds.y).min(bounds.y2() - height);
        Rect::new(x, y, width, height)
    }

    /// Check that the rectangle lies within an image of the given size.
    pub fn is_within(&self, width: f64, height: f64) -> bool {
        const EPS: f64 = 1e-6;
        self.x >= -EPS
            && self.y >= -EPS
            && self.width >= 0.0
            && self.height >= 0.0
            && self.x2() <= width + EPS
            && self.y2() <= height + EPS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_iou() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        let b = Rect::new(50.0, 50.0, 100.0, 100.0);

        // Intersection 2500, union 17500
        assert!((a.iou(&b) - 0.1428).abs() < 0.01);
        assert_eq!(a.iou(&Rect::new(200.0, 200.0, 10.0, 10.0)), 0.0);
    }

    #[test]
    fn test_rect_union() {
        let rects = vec![
            Rect::new(10.0, 10.0, 20.0, 20.0),
            Rect::new(100.0, 100.0, 30.0, 30.0),
        ];

        let union = Rect::union(&rects).unwrap();
        assert_eq!(union, Rect::new(10.0, 10.0, 120.0, 120.0));
        assert!(Rect::union(&[]).is_none());
    }

    #[test]
    fn test_clip_and_shift() {
        let r = Rect::new(-10.0, 90.0, 50.0, 50.0);
        let clipped = r.clip_to(100.0, 100.0);
        assert_eq!(clipped, Rect::new(0.0, 90.0, 40.0, 10.0));

        let bounds = Rect::new(0.0, 0.0, 100.0, 100.0);
        let shifted = r.shift_into(&bounds);
        assert_eq!(shifted, Rect::new(0.0, 50.0, 50.0, 50.0));
        assert!(shifted.is_within(100.0, 100.0));
    }
}
