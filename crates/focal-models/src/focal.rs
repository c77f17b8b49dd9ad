//! The resolved focal rectangle.

use serde::{Deserialize, Serialize};

use crate::rect::Rect;

/// How the focal point was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FocalPointType {
    /// One or more detected faces
    Face,
    /// Best visual-interest candidate
    Interest,
    /// Geometric center crop
    CenterFallback,
}

impl FocalPointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FocalPointType::Face => "face",
            FocalPointType::Interest => "interest",
            FocalPointType::CenterFallback => "center-fallback",
        }
    }
}

impl std::fmt::Display for FocalPointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single region of an image used to anchor the crop/zoom animation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocalPoint {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(rename = "type")]
    pub kind: FocalPointType,
    /// Human-readable explanation, e.g. `multi-face-bounds` or a fallback reason
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl FocalPoint {
    pub fn new(
        rect: Rect,
        kind: FocalPointType,
        method: impl Into<String>,
        confidence: Option<f64>,
    ) -> Self {
        Self {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            kind,
            method: method.into(),
            confidence,
        }
    }

    /// Centered rectangle spanning half of each image dimension.
    pub fn center_fallback(image_width: f64, image_height: f64, reason: impl Into<String>) -> Self {
        Self::new(
            Rect::new(
                image_width * 0.25,
                image_height * 0.25,
                image_width * 0.5,
                image_height * 0.5,
            ),
            FocalPointType::CenterFallback,
            reason,
            None,
        )
    }

    #[inline]
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// Express the rectangle as fractions of the image dimensions.
    pub fn to_fractions(&self, image_width: f64, image_height: f64) -> Rect {
        if image_width <= 0.0 || image_height <= 0.0 {
            return Rect::default();
        }
        Rect::new(
            self.x / image_width,
            self.y / image_height,
            self.width / image_width,
            self.height / image_height,
        )
    }

    pub fn is_fallback(&self) -> bool {
        self.kind == FocalPointType::CenterFallback
    }
}
