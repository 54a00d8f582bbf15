//! Frame type and pixel conversions to packed RGB.

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB24 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// True if more than `threshold_pct` of pixels are near black (luma < 32).
    pub fn is_dark(&self, threshold_pct: f32) -> bool {
        let pixels = self.data.len() / 3;
        if pixels == 0 {
            return true;
        }
        let dark = self.data.chunks_exact(3).filter(|px| luma(px) < 32.0).count();
        (dark as f32 / pixels as f32) > threshold_pct
    }
}

fn luma(px: &[u8]) -> f32 {
    0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded MJPEG frame is {actual_w}x{actual_h}, negotiated {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// Convert packed YUYV (4:2:2) to RGB24 using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.push((c + 1.596 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c - 0.392 * u - 0.813 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c + 2.017 * u).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(rgb)
}

/// Replicate an 8-bit grayscale buffer into RGB24.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    Ok(grey[..expected].iter().flat_map(|&p| [p, p, p]).collect())
}

/// Decode one MJPEG buffer into RGB24, checking it matches the negotiated size.
pub fn mjpeg_to_rgb(jpeg: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)?.into_rgb8();
    let (actual_w, actual_h) = decoded.dimensions();
    if (actual_w, actual_h) != (width, height) {
        return Err(FrameError::SizeMismatch {
            width,
            height,
            actual_w,
            actual_h,
        });
    }
    Ok(decoded.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        }
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_grey() {
        // 2x1 image, Y=16 (black) and Y=235 (white), neutral chroma.
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_red_dominant() {
        // Strong V pushes towards red.
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240], 2, 1).unwrap();
        assert!(rgb[0] > 200 && rgb[1] < 60 && rgb[2] < 60, "{rgb:?}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_to_rgb() {
        assert_eq!(grey_to_rgb(&[7, 200], 2, 1).unwrap(), vec![7, 7, 7, 200, 200, 200]);
        assert!(grey_to_rgb(&[7], 2, 1).is_err());
    }

    #[test]
    fn test_mjpeg_roundtrip_size_check() {
        let img = image::RgbImage::from_pixel(8, 4, image::Rgb([120, 60, 30]));
        let mut jpeg = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let rgb = mjpeg_to_rgb(&jpeg, 8, 4).unwrap();
        assert_eq!(rgb.len(), 8 * 4 * 3);
        assert!(matches!(
            mjpeg_to_rgb(&jpeg, 16, 4),
            Err(FrameError::SizeMismatch { .. })
        ));
        assert!(matches!(mjpeg_to_rgb(&[0, 1, 2], 8, 4), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_dark_frame() {
        assert!(frame(vec![0; 300], 10, 10).is_dark(0.95));
        assert!(!frame(vec![128; 300], 10, 10).is_dark(0.95));
        assert!(frame(Vec::new(), 0, 0).is_dark(0.95));

        // 96% dark pixels
        let mut data = vec![5u8; 96 * 3];
        data.extend(vec![200u8; 4 * 3]);
        assert!(frame(data, 10, 10).is_dark(0.95));
    }
}
