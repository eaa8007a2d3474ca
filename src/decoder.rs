//! Turns an inbound frame payload into the fixed-shape RGB tensor the model
//! consumes.
//!
//! A payload is base64 image data, optionally preceded by a browser data-URI
//! header such as `data:image/png;base64,`. Everything up to and including the
//! first `base64,` is dropped; no MIME parsing is attempted. The remaining
//! bytes may be any raster format the `image` crate can sniff. The decoded
//! image is resized to 150x150 with a bilinear filter, flattened to RGB, and
//! scaled according to [`PixelScale`].

use crate::config::DecoderSettings;
use crate::{CHANNELS, IMAGE_SIZE};
use base64::{engine::general_purpose, Engine as _};
use image::imageops::FilterType;
use image::io::{Limits, Reader};
use image::DynamicImage;
use serde::Deserialize;
use std::io::Cursor;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// Marker separating a data-URI header from its payload
const BASE64_MARKER: &str = "base64,";

/// Resampling filter used for every resize
const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// Shape of every [`DecodedImage`]: batch, height, width, channels
pub const INPUT_SHAPE: [usize; 4] = [1, IMAGE_SIZE as usize, IMAGE_SIZE as usize, CHANNELS];

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unrecognized image format: {0}")]
    Format(#[from] std::io::Error),

    #[error("image decoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("image codec panicked")]
    Panic,
}

/// Value range of the channels in a decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelScale {
    /// Source pixel values, 0 to 255
    Raw,

    /// Pixel values divided by 255, 0 to 1
    Unit,
}

impl PixelScale {
    fn apply(self, value: u8) -> f32 {
        match self {
            PixelScale::Raw => value as f32,
            PixelScale::Unit => value as f32 / 255.0,
        }
    }
}

/// A `[1, 150, 150, 3]` row-major float tensor in RGB order
#[derive(Clone, PartialEq)]
pub struct DecodedImage {
    data: Vec<f32>,
}

impl DecodedImage {
    /// Number of elements in every decoded image
    pub const LEN: usize = INPUT_SHAPE[0] * INPUT_SHAPE[1] * INPUT_SHAPE[2] * INPUT_SHAPE[3];

    /// Build from an already-resized RGB buffer
    fn from_rgb(rgb: &[u8], scale: PixelScale) -> Self {
        debug_assert_eq!(rgb.len(), Self::LEN);
        Self {
            data: rgb.iter().map(|&v| scale.apply(v)).collect(),
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        INPUT_SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// The channel values at row `y`, column `x`
    pub fn pixel(&self, y: usize, x: usize) -> [f32; CHANNELS] {
        let start = (y * INPUT_SHAPE[2] + x) * CHANNELS;
        [self.data[start], self.data[start + 1], self.data[start + 2]]
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecodedImage {{ shape: {:?}, data: <f32> }}", INPUT_SHAPE)
    }
}

#[derive(Debug, Clone)]
pub struct ImageDecoder {
    scale: PixelScale,
    max_dimension: u32,

    /// Bytes a codec may allocate while decoding one frame
    max_alloc: u64,
}

impl Default for ImageDecoder {
    fn default() -> Self {
        Self::new(&DecoderSettings::default())
    }
}

impl ImageDecoder {
    pub fn new(settings: &DecoderSettings) -> Self {
        let side = u64::from(settings.max_dimension);
        Self {
            scale: settings.pixel_scale,
            max_dimension: settings.max_dimension,
            max_alloc: (side * side * 4).min(settings.max_alloc_bytes),
        }
    }

    pub fn with_scale(mut self, scale: PixelScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn scale(&self) -> PixelScale {
        self.scale
    }

    /// Decode a base64 or data-URI payload. Failures are logged here and
    /// returned to the caller, never raised
    pub fn decode(&self, payload: &str) -> Result<DecodedImage, DecodeError> {
        self.try_decode(payload).map_err(|e| {
            warn!("rejecting frame: {e}");
            e
        })
    }

    fn try_decode(&self, payload: &str) -> Result<DecodedImage, DecodeError> {
        let encoded = strip_data_uri(payload);
        if encoded.is_empty() {
            return Err(DecodeError::Empty);
        }
        let bytes = general_purpose::STANDARD.decode(encoded)?;
        self.decode_bytes(&bytes)
    }

    /// Decode raw encoded image bytes (PNG, JPEG, ...)
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let image = self.read_image(bytes)?;
        debug!(
            "decoded {}x{} {:?} frame",
            image.width(),
            image.height(),
            image.color()
        );

        let resized = image.resize_exact(IMAGE_SIZE, IMAGE_SIZE, RESIZE_FILTER);
        let rgb = resized.to_rgb8();
        Ok(DecodedImage::from_rgb(rgb.as_raw(), self.scale))
    }

    fn read_image(&self, bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        // A 16-bit or many-frame source can stay inside the dimension limit
        // and still need far more than an 8-bit RGBA buffer
        limits.max_alloc = Some(self.max_alloc);

        let mut reader = Reader::new(Cursor::new(bytes)).with_guessed_format()?;
        reader.limits(limits);

        // Some codecs panic on hostile input instead of erroring
        panic::catch_unwind(AssertUnwindSafe(move || reader.decode()))
            .map_err(|_| DecodeError::Panic)?
            .map_err(DecodeError::from)
    }
}

/// Drop everything up to and including the first `base64,`
pub fn strip_data_uri(payload: &str) -> &str {
    match payload.find(BASE64_MARKER) {
        Some(idx) => &payload[idx + BASE64_MARKER.len()..],
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::*;
    use image::{
        GrayImage, ImageBuffer, ImageOutputFormat, Luma, Rgb, Rgba, RgbImage, RgbaImage,
    };

    fn decoder() -> ImageDecoder {
        ImageDecoder::default()
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    #[test]
    fn test_shape_is_fixed() {
        for (w, h) in [(1, 1), (150, 150), (300, 300), (640, 480), (17, 333)] {
            let img = solid_rgb(w, h, [1, 2, 3]);
            let decoded = decoder().decode(&b64_png(&img)).unwrap();
            assert_eq!(decoded.shape(), [1, 150, 150, 3]);
            assert_eq!(decoded.as_slice().len(), 150 * 150 * 3);
        }

        let rgb16 = DynamicImage::ImageRgb16(ImageBuffer::from_fn(90, 60, |x, y| {
            Rgb([(x * 700) as u16, (y * 1000) as u16, 65535])
        }));
        let luma16 =
            DynamicImage::ImageLuma16(ImageBuffer::from_pixel(33, 120, Luma([40000u16])));
        let payloads = [
            ("jpeg", b64_as(&gradient(320, 240), ImageOutputFormat::Jpeg(90))),
            (
                "jpeg grayscale",
                b64_as(&gradient(64, 64).grayscale(), ImageOutputFormat::Jpeg(75)),
            ),
            // GIF frames are palette indexed on the wire
            (
                "gif",
                b64_as(
                    &DynamicImage::ImageRgba8(gradient(200, 120).to_rgba8()),
                    ImageOutputFormat::Gif,
                ),
            ),
            ("bmp", b64_as(&gradient(45, 70), ImageOutputFormat::Bmp)),
            ("png rgb16", b64_png(&rgb16)),
            ("png luma16", b64_png(&luma16)),
        ];
        for (name, payload) in payloads {
            let decoded = decoder()
                .decode(&payload)
                .unwrap_or_else(|e| panic!("{name}: {e}"));
            assert_eq!(decoded.shape(), [1, 150, 150, 3], "{name}");
            assert_eq!(decoded.as_slice().len(), DecodedImage::LEN, "{name}");
        }
    }

    #[test]
    fn test_grayscale_is_expanded() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 40, Luma([100])));
        let decoded = decoder().decode(&b64_png(&img)).unwrap();
        assert_eq!(decoded.as_slice().len(), DecodedImage::LEN);
        assert_eq!(decoded.pixel(0, 0), [100.0, 100.0, 100.0]);
        assert_eq!(decoded.pixel(149, 149), [100.0, 100.0, 100.0]);
    }

    #[test]
    fn test_alpha_is_dropped() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(80, 80, Rgba([10, 20, 30, 128])));
        let decoded = decoder().decode(&b64_png(&img)).unwrap();
        assert_eq!(decoded.as_slice().len(), DecodedImage::LEN);
        assert_eq!(decoded.pixel(75, 75), [10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_data_uri_matches_raw() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(40, 30, |x, y| {
            image::Rgb([x as u8, y as u8, (x + y) as u8])
        }));
        let raw = decoder().decode(&b64_png(&img)).unwrap();
        let uri = decoder().decode(&data_uri_png(&img)).unwrap();
        assert_eq!(raw, uri);
    }

    #[test]
    fn test_strip_only_first_marker() {
        assert_eq!(strip_data_uri("abc"), "abc");
        assert_eq!(strip_data_uri("data:image/png;base64,abc"), "abc");
        assert_eq!(strip_data_uri("base64,base64,abc"), "base64,abc");

        let doubled = format!("data:image/png;base64,{}", data_uri_png(&solid_rgb(4, 4, [0; 3])));
        assert!(matches!(
            decoder().decode(&doubled),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            decoder().decode("not-base64!!"),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(decoder().decode(""), Err(DecodeError::Empty)));
        assert!(matches!(
            decoder().decode("data:image/png;base64,"),
            Err(DecodeError::Empty)
        ));

        // Valid base64, but not an image
        let text = general_purpose::STANDARD.encode(b"hello, world");
        assert!(decoder().decode(&text).is_err());

        // A truncated PNG
        let mut png = png_bytes(&solid_rgb(32, 32, [9, 9, 9]));
        png.truncate(png.len() / 2);
        let truncated = general_purpose::STANDARD.encode(&png);
        assert!(decoder().decode(&truncated).is_err());
    }

    #[test]
    fn test_pixel_scale() {
        let img = solid_rgb(10, 10, [255, 0, 51]);
        let raw = decoder().decode(&b64_png(&img)).unwrap();
        assert_eq!(raw.pixel(5, 5), [255.0, 0.0, 51.0]);

        let unit = decoder()
            .with_scale(PixelScale::Unit)
            .decode(&b64_png(&img))
            .unwrap();
        assert_eq!(unit.pixel(5, 5), [1.0, 0.0, 0.2]);
        assert!(unit.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_oversized_image_is_rejected() {
        let decoder = ImageDecoder::new(&DecoderSettings {
            max_dimension: 64,
            ..Default::default()
        });
        let img = solid_rgb(100, 20, [0, 0, 0]);
        assert!(matches!(
            decoder.decode(&b64_png(&img)),
            Err(DecodeError::Image(_))
        ));
    }

    #[test]
    fn test_allocation_budget() {
        // 600x600 RGBA at 16 bits per channel needs ~2.7 MiB of pixels
        let img = DynamicImage::ImageRgba16(ImageBuffer::from_pixel(
            600,
            600,
            Rgba([1000u16, 2000, 3000, 65535]),
        ));
        let payload = b64_png(&img);

        let tight = ImageDecoder::new(&DecoderSettings {
            max_dimension: 1024,
            max_alloc_bytes: 1024 * 1024,
            ..Default::default()
        });
        assert!(matches!(
            tight.decode(&payload),
            Err(DecodeError::Image(_))
        ));

        // The same frame fits the default budget
        assert_eq!(decoder().decode(&payload).unwrap().shape(), INPUT_SHAPE);
    }

    #[test]
    fn test_budget_follows_dimension() {
        let small = ImageDecoder::new(&DecoderSettings {
            max_dimension: 100,
            ..Default::default()
        });
        assert_eq!(small.max_alloc, 100 * 100 * 4);
        assert_eq!(decoder().max_alloc, 64 * 1024 * 1024);
    }

    #[test]
    fn test_deterministic() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(301, 199, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 7])
        }));
        let payload = b64_png(&img);
        assert_eq!(
            decoder().decode(&payload).unwrap(),
            decoder().decode(&payload).unwrap()
        );
    }
}
