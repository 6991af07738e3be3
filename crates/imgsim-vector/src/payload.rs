//! Image payload validation
//!
//! Callers hand over images either as raw bytes or base64 text. Before any
//! model call the payload is decoded and the image is parsed once, so
//! malformed input fails fast with `InvalidImage` instead of surfacing as
//! an opaque model error.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use imgsim_core::{ImagePayload, ImgsimError, Result};

/// An image that decoded successfully
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    /// Encoded image bytes, as received
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Decode a payload and verify it is a readable image
///
/// This parses the full image and is CPU bound; async callers should run it
/// on a blocking thread.
pub fn decode_image(payload: ImagePayload) -> Result<ValidatedImage> {
    let bytes = match payload {
        ImagePayload::Bytes(bytes) => bytes,
        ImagePayload::Base64(text) => decode_base64(&text)?,
    };
    if bytes.is_empty() {
        return Err(ImgsimError::InvalidImage("empty image payload".to_string()));
    }

    let format = image::guess_format(&bytes)
        .map_err(|e| ImgsimError::InvalidImage(format!("unrecognized image format: {e}")))?;
    let decoded = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| ImgsimError::InvalidImage(format!("failed to decode {format:?}: {e}")))?;

    Ok(ValidatedImage {
        width: decoded.width(),
        height: decoded.height(),
        bytes,
        format,
    })
}

/// Decode base64 text, accepting an optional `data:<mime>;base64,` prefix
fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let body = match text.trim_start().strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ImgsimError::InvalidImage("malformed data URL".to_string()))?,
        None => text,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();

    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ImgsimError::InvalidImage(format!("invalid base64: {e}")))
}

/// Base64 text for a validated image, as sent to the model endpoint
pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_pixel(width, height, Rgb([200, 30, 30]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_raw_png() {
        let image = decode_image(ImagePayload::bytes(png_bytes(4, 3))).unwrap();
        assert_eq!(image.format, ImageFormat::Png);
        assert_eq!((image.width, image.height), (4, 3));
    }

    #[test]
    fn test_base64_png_with_data_url_and_newlines() {
        let encoded = encode_base64(&png_bytes(2, 2));
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        let text = format!("data:image/png;base64,{head}\n{tail}");

        let image = decode_image(ImagePayload::base64(text)).unwrap();
        assert_eq!((image.width, image.height), (2, 2));
    }

    #[test]
    fn test_rejects_bad_base64() {
        let err = decode_image(ImagePayload::base64("not base64 at all!")).unwrap_err();
        assert!(matches!(err, ImgsimError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_non_image_bytes() {
        let err = decode_image(ImagePayload::bytes(b"hello world".to_vec())).unwrap_err();
        assert!(matches!(err, ImgsimError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_truncated_png() {
        let mut bytes = png_bytes(8, 8);
        bytes.truncate(bytes.len() / 2);
        let err = decode_image(ImagePayload::bytes(bytes)).unwrap_err();
        assert!(matches!(err, ImgsimError::InvalidImage(_)));
    }

    #[test]
    fn test_rejects_empty() {
        assert!(decode_image(ImagePayload::bytes(Vec::new())).is_err());
        assert!(decode_image(ImagePayload::base64("")).is_err());
    }
}
