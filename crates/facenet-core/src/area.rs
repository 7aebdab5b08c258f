//! Face geometry: square detection areas and relative crop areas.
//!
//! Detector output is expressed as [`Area`]: a named square addressed by its
//! center in source-image pixels. Cropping and overlap tests work on
//! [`RelativeArea`], whose coordinates are fractions of the image size so that
//! they survive image resizing.

use serde::{Deserialize, Serialize};

/// A named square region in source-image pixels.
///
/// `row`/`col` address the center of the square, not its corner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub name: String,
    pub row: i32,
    pub col: i32,
    /// Side length of the square in pixels. Never negative.
    pub scale: i32,
}

impl Area {
    pub fn new(name: impl Into<String>, row: i32, col: i32, scale: i32) -> Self {
        Self {
            name: name.into(),
            row,
            col,
            scale: scale.max(0),
        }
    }

    /// True when the area has no usable position (row or column not positive).
    pub fn is_degenerate(&self) -> bool {
        self.row <= 0 || self.col <= 0
    }

    /// Offset of this area's center from `reference`, normalized by image size.
    pub fn relative(&self, reference: &Area, rows: f32, cols: f32) -> RelativeArea {
        let rows = rows.max(1.0);
        let cols = cols.max(1.0);
        RelativeArea::new(
            self.name.clone(),
            (self.col - reference.col) as f32 / cols,
            (self.row - reference.row) as f32 / rows,
            self.scale as f32 / cols,
            self.scale as f32 / rows,
        )
    }

    /// True when the center of `other` lies inside this square (edges included).
    pub fn contains(&self, other: &Area) -> bool {
        let half = self.scale / 2;
        (self.row - half..=self.row + half).contains(&other.row)
            && (self.col - half..=self.col + half).contains(&other.col)
    }
}

impl Default for Area {
    fn default() -> Self {
        Area::new("face", 0, 0, 0)
    }
}

/// Convert a list of areas to relative areas around a common reference point.
pub fn relative_areas(areas: &[Area], reference: &Area, rows: f32, cols: f32) -> Vec<RelativeArea> {
    areas
        .iter()
        .map(|a| a.relative(reference, rows, cols))
        .collect()
}

/// A rectangle expressed as fractions of image width (`x`, `w`) and height (`y`, `h`).
///
/// Origin is the top-left corner of the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeArea {
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// Absolute pixel rectangle, clamped to the image it was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RelativeArea {
    pub fn new(name: impl Into<String>, x: f32, y: f32, w: f32, h: f32) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            w,
            h,
        }
    }

    pub fn surface(&self) -> f32 {
        self.w * self.h
    }

    /// Width and height of the intersection with `other` (zero when disjoint).
    pub fn overlap(&self, other: &RelativeArea) -> (f32, f32) {
        let x = ((self.x + self.w).min(other.x + other.w) - self.x.max(other.x)).max(0.0);
        let y = ((self.y + self.h).min(other.y + other.h) - self.y.max(other.y)).max(0.0);
        (x, y)
    }

    pub fn overlap_area(&self, other: &RelativeArea) -> f32 {
        let (x, y) = self.overlap(other);
        x * y
    }

    /// Intersection surface as a rounded percentage of the smaller surface.
    pub fn overlap_percent(&self, other: &RelativeArea) -> i32 {
        let smaller = self.surface().min(other.surface());
        if smaller <= 0.0 {
            return 0;
        }
        (100.0 * self.overlap_area(other) / smaller).round() as i32
    }

    /// Pixel rectangle for an image of `width` × `height`, clamped to the image.
    pub fn bounds(&self, width: u32, height: u32) -> PixelBounds {
        let w = width as f32;
        let h = height as f32;
        let x0 = (self.x * w).clamp(0.0, w) as u32;
        let y0 = (self.y * h).clamp(0.0, h) as u32;
        let x1 = ((self.x + self.w) * w).clamp(0.0, w) as u32;
        let y1 = ((self.y + self.h) * h).clamp(0.0, h) as u32;

        PixelBounds {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0),
            height: y1.saturating_sub(y0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_scale_clamped() {
        let a = Area::new("face", 10, 10, -5);
        assert_eq!(a.scale, 0);
    }

    #[test]
    fn test_degenerate() {
        assert!(Area::new("eye_l", 0, 12, 4).is_degenerate());
        assert!(Area::new("eye_l", 12, -1, 4).is_degenerate());
        assert!(!Area::new("eye_l", 12, 12, 4).is_degenerate());
    }

    #[test]
    fn test_contains_center_inside() {
        let face = Area::new("face", 100, 100, 50);
        assert!(face.contains(&Area::new("eye_l", 90, 85, 10)));
        assert!(face.contains(&Area::new("edge", 125, 75, 10)));
        assert!(!face.contains(&Area::new("far", 130, 100, 10)));
    }

    #[test]
    fn test_relative_to_reference() {
        let eye = Area::new("eye_l", 90, 80, 20);
        let mid = Area::new("midpoint", 100, 100, 20);
        let rel = eye.relative(&mid, 200.0, 400.0);
        assert!((rel.x - (-20.0 / 400.0)).abs() < 1e-6);
        assert!((rel.y - (-10.0 / 200.0)).abs() < 1e-6);
        assert!((rel.w - 20.0 / 400.0).abs() < 1e-6);
        assert!((rel.h - 20.0 / 200.0).abs() < 1e-6);
        assert_eq!(rel.name, "eye_l");
    }

    #[test]
    fn test_overlap_percent_identical() {
        let a = RelativeArea::new("a", 0.1, 0.1, 0.2, 0.2);
        assert_eq!(a.overlap_percent(&a), 100);
    }

    #[test]
    fn test_overlap_percent_disjoint() {
        let a = RelativeArea::new("a", 0.0, 0.0, 0.1, 0.1);
        let b = RelativeArea::new("b", 0.5, 0.5, 0.1, 0.1);
        assert_eq!(a.overlap_percent(&b), 0);
    }

    #[test]
    fn test_overlap_percent_uses_smaller_surface() {
        // Small square fully inside a large one counts as a full overlap.
        let big = RelativeArea::new("big", 0.0, 0.0, 0.5, 0.5);
        let small = RelativeArea::new("small", 0.1, 0.1, 0.1, 0.1);
        assert_eq!(big.overlap_percent(&small), 100);
        assert_eq!(small.overlap_percent(&big), 100);
    }

    #[test]
    fn test_overlap_percent_half() {
        let a = RelativeArea::new("a", 0.0, 0.0, 0.2, 0.2);
        let b = RelativeArea::new("b", 0.1, 0.0, 0.2, 0.2);
        assert_eq!(a.overlap_percent(&b), 50);
    }

    #[test]
    fn test_bounds_clamped() {
        let a = RelativeArea::new("face", -0.25, 0.75, 0.5, 0.5);
        let b = a.bounds(100, 100);
        assert_eq!(b, PixelBounds { x: 0, y: 75, width: 25, height: 25 });
    }

    #[test]
    fn test_bounds_inside() {
        let a = RelativeArea::new("face", 0.375, 0.25, 0.25, 0.5);
        let b = a.bounds(200, 100);
        assert_eq!(b, PixelBounds { x: 75, y: 25, width: 50, height: 50 });
    }
}
