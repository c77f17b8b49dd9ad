//! Debug overlay: detections and the focal rectangle drawn on a JPEG.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use focal_models::{FaceCandidate, FocalPoint, InterestCandidate, InterestMethod, Rect};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect as DrawRect;

use crate::error::{VisionError, VisionResult};
use crate::resources::RequestScope;

const FACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const FEATURE_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
const WINDOW_COLOR: Rgb<u8> = Rgb([0, 160, 255]);
const GRADIENT_COLOR: Rgb<u8> = Rgb([255, 0, 255]);
const FOCAL_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const JPEG_QUALITY: u8 = 85;

fn method_color(method: InterestMethod) -> Rgb<u8> {
    match method {
        InterestMethod::FeatureCluster => FEATURE_COLOR,
        InterestMethod::SlidingWindow => WINDOW_COLOR,
        InterestMethod::Gradient => GRADIENT_COLOR,
    }
}

/// Draw `rect` with the given stroke width, skipping empty or off-image boxes.
fn draw_box(canvas: &mut RgbImage, rect: &Rect, color: Rgb<u8>, thickness: u32) {
    let (w, h) = (canvas.width() as f64, canvas.height() as f64);
    let clipped = rect.clip_to(w, h);
    if clipped.width < 1.0 || clipped.height < 1.0 {
        return;
    }

    for t in 0..thickness {
        let inset = t as f64;
        let width = clipped.width - 2.0 * inset;
        let height = clipped.height - 2.0 * inset;
        if width < 1.0 || height < 1.0 {
            break;
        }
        let r = DrawRect::at((clipped.x + inset) as i32, (clipped.y + inset) as i32)
            .of_size(width as u32, height as u32);
        draw_hollow_rect_mut(canvas, r, color);
    }
}

/// Render the overlay and return it as base64-encoded JPEG.
pub fn render_overlay(
    image: &DynamicImage,
    faces: &[FaceCandidate],
    interest: &[InterestCandidate],
    focal: &FocalPoint,
    scope: &RequestScope<'_>,
) -> VisionResult<String> {
    let mut canvas = scope.track("debug_canvas", image.to_rgb8());
    let stroke = (canvas.width().max(canvas.height()) / 400).max(1);

    for c in interest {
        draw_box(&mut canvas, &c.rect(), method_color(c.method), stroke);
    }
    for f in faces {
        draw_box(&mut canvas, &f.rect(), FACE_COLOR, stroke + 1);
    }
    draw_box(&mut canvas, &focal.rect(), FOCAL_COLOR, stroke + 2);

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&*canvas)
        .map_err(|e| VisionError::processing(format!("Failed to encode debug overlay: {}", e)))?;

    Ok(STANDARD.encode(&jpeg))
}
