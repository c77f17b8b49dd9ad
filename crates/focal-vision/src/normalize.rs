//! Image Normalizer: decode bytes and apply EXIF orientation.

use std::io::Cursor;

use image::{DynamicImage, GenericImageView};
use tracing::debug;

use crate::error::{VisionError, VisionResult};
use crate::resources::{RequestScope, Tracked};

/// Decoded, upright pixel buffer owned by one request.
#[derive(Debug)]
pub struct NormalizedImage<'s> {
    image: Tracked<'s, DynamicImage>,
    orientation: u32,
}

impl<'s> NormalizedImage<'s> {
    /// Width after orientation correction.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height after orientation correction.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    /// EXIF orientation tag that was applied (1 = none).
    pub fn orientation(&self) -> u32 {
        self.orientation
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }
}

/// Decode `bytes` and rotate/flip so width and height match the visual
/// orientation. Fails with a decode error for empty or unreadable input.
pub fn normalize<'s>(bytes: &[u8], scope: &'s RequestScope<'_>) -> VisionResult<NormalizedImage<'s>> {
    if bytes.is_empty() {
        return Err(VisionError::decode("empty image payload"));
    }

    let decoded = image::load_from_memory(bytes).map_err(|e| VisionError::decode(e.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(VisionError::decode("image has zero width or height"));
    }

    let decoded = scope.track("decoded", decoded);
    let orientation = read_exif_orientation(bytes);
    let image = if orientation == 1 {
        decoded
    } else {
        let upright = scope.track("normalized", apply_orientation(&decoded, orientation));
        drop(decoded);
        upright
    };
    let (width, height) = image.dimensions();

    debug!(width, height, orientation, "Image normalized");

    Ok(NormalizedImage { image, orientation })
}

/// Read EXIF tag 0x0112. Images without EXIF data report 1 (upright).
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut cursor) else {
        return 1;
    };

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .filter(|o| (1..=8).contains(o))
        .unwrap_or(1)
}

/// Apply an EXIF orientation value.
///
/// 2: mirror, 3: 180°, 4: vertical flip, 5: transpose, 6: 90° CW,
/// 7: transverse, 8: 90° CCW.
pub fn apply_orientation(image: &DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image.clone(),
    }
}
