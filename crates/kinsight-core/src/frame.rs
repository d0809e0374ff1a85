//! Frame type and input decoding: base64 payloads, data URLs, RGB conversion.

use base64::Engine;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("image payload is empty")]
    Empty,
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("undecodable image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has zero area ({width}x{height})")]
    ZeroSized { width: u32, height: u32 },
}

/// A decoded RGB frame ready for detection.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
}

impl Frame {
    /// Decode encoded image bytes (JPEG, PNG, ...) into an RGB frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let image = image::load_from_memory(bytes)?.to_rgb8();
        Self::from_rgb(image)
    }

    /// Wrap an already decoded RGB image.
    pub fn from_rgb(image: RgbImage) -> Result<Self, FrameError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::ZeroSized { width, height });
        }
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Sample channel `c` at integer coordinates, 0 outside the frame.
    #[inline]
    pub fn sample(&self, x: i32, y: i32, c: usize) -> f32 {
        if x < 0 || y < 0 || x >= self.width() as i32 || y >= self.height() as i32 {
            return 0.0;
        }
        self.image.get_pixel(x as u32, y as u32).0[c] as f32
    }
}

/// Decode a base64 image payload, stripping a `data:<mime>;base64,` prefix if present.
///
/// Everything up to and including the first `,` is treated as the prefix.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, FrameError> {
    let body = match payload.split_once(',') {
        Some((_, rest)) => rest,
        None => payload,
    };
    let body = body.trim();
    if body.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(base64::engine::general_purpose::STANDARD.decode(body)?)
}

/// Encode raw image bytes as a plain base64 payload.
pub fn encode_payload(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
