//! JPEG encoding for streamed frames and notification snapshots.

use anyhow::{Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{
    RgbImage,
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};
use video_ingest::Frame;

/// Convert a raw capture frame into an RGB image buffer.
pub(crate) fn frame_to_image(frame: &Frame) -> Result<RgbImage> {
    if frame.width <= 0 || frame.height <= 0 || frame.data.len() != frame.expected_len() {
        return Err(anyhow!(
            "frame buffer of {} bytes does not match {}x{}",
            frame.data.len(),
            frame.width,
            frame.height
        ));
    }
    RgbImage::from_raw(frame.width as u32, frame.height as u32, frame.to_rgb())
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Downscale to `max_width` (keeping aspect ratio), re-encode and base64 the snapshot.
pub(crate) fn prepare_snapshot(frame: &Frame, max_width: u32, quality: u8) -> Result<String> {
    let image = frame_to_image(frame)?;
    let image = downscale_to_width(image, max_width);
    let jpeg = encode_jpeg(&image, quality)?;
    Ok(STANDARD.encode(jpeg))
}

fn downscale_to_width(image: RgbImage, max_width: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if max_width == 0 || width <= max_width {
        return image;
    }
    let scaled_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
    imageops::resize(&image, max_width, scaled_height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use image::GenericImageView;
    use video_ingest::FrameFormat;

    use super::*;

    fn frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![128; (width * height * 3) as usize],
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn converts_bgr_to_rgb() {
        let frame = Frame {
            data: vec![10, 20, 30],
            width: 1,
            height: 1,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        let image = frame_to_image(&frame).expect("valid frame");
        assert_eq!(image.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let mut broken = frame(4, 4);
        broken.data.truncate(5);
        assert!(frame_to_image(&broken).is_err());
    }

    #[test]
    fn snapshot_is_downscaled_preserving_aspect() {
        let encoded = prepare_snapshot(&frame(1280, 720), 640, 60).expect("snapshot");
        let jpeg = STANDARD.decode(encoded).expect("base64");
        let decoded = image::load_from_memory(&jpeg).expect("jpeg");
        assert_eq!(decoded.dimensions(), (640, 360));
    }

    #[test]
    fn narrow_snapshots_keep_their_size() {
        let encoded = prepare_snapshot(&frame(320, 240), 640, 60).expect("snapshot");
        let jpeg = STANDARD.decode(encoded).expect("base64");
        let decoded = image::load_from_memory(&jpeg).expect("jpeg");
        assert_eq!(decoded.dimensions(), (320, 240));
    }
}
