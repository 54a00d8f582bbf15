//! Face crop: square region around a detection, resized for the descriptor network.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.2;

/// Square pixel region in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// Square region centred on the face, grown by [`CROP_MARGIN`] and clamped to the frame.
///
/// Returns `None` if the clamped region is empty.
pub fn crop_region(face: &BoundingBox, width: u32, height: u32) -> Option<CropRegion> {
    let longest = face.width.max(face.height);
    let side = (longest + 2.0 * CROP_MARGIN * longest)
        .min(width as f32)
        .min(height as f32);
    if !(side >= 1.0) {
        return None;
    }

    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let x = (cx - side / 2.0).clamp(0.0, width as f32 - side);
    let y = (cy - side / 2.0).clamp(0.0, height as f32 - side);

    Some(CropRegion {
        x: x.floor() as u32,
        y: y.floor() as u32,
        size: side.round() as u32,
    })
}

/// Crop the face out of an RGB frame and resize it to `out_size`×`out_size`.
pub fn crop_face(
    rgb: &[u8],
    width: u32,
    height: u32,
    face: &BoundingBox,
    out_size: u32,
) -> Option<RgbImage> {
    let region = crop_region(face, width, height)?;
    let frame = RgbImage::from_raw(width, height, rgb.to_vec())?;
    let cropped = imageops::crop_imm(&frame, region.x, region.y, region.size, region.size).to_image();
    Some(imageops::resize(&cropped, out_size, out_size, FilterType::Triangle))
}
