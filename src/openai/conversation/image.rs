use super::ConversationError;
use base64::{engine::general_purpose, Engine as _};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Side length of the placeholder injected when a conversation carries no image.
pub const BLANK_IMAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Decoded from a `data:image/...;base64,` URI in the request
    InlineBase64,
    /// Synthetic blank placeholder
    Blank,
}

/// An image content part: the encoded bytes as received plus decoded RGB pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePart {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub pixels: RgbImage,
    pub source: ImageSource,
}

impl ImagePart {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn is_blank(&self) -> bool {
        self.source == ImageSource::Blank
    }

    /// Re-serialize as a `data:` URI carrying the original encoded bytes.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.to_mime_type(),
            general_purpose::STANDARD.encode(&self.data)
        )
    }

    /// Decode a `data:image/<fmt>;base64,<payload>` URI.
    pub fn from_data_url(url: &str) -> Result<Self, ConversationError> {
        let (header, payload) = url
            .split_once(',')
            .ok_or_else(|| ConversationError::InvalidDataUrl("missing `,` separator".into()))?;

        let media = header
            .strip_prefix("data:")
            .ok_or_else(|| {
                ConversationError::InvalidDataUrl(
                    "only inline `data:image/...;base64,` URLs are supported".into(),
                )
            })?;
        let media = media.strip_suffix(";base64").ok_or_else(|| {
            ConversationError::InvalidDataUrl("payload must be base64 encoded".into())
        })?;
        if !media.starts_with("image/") {
            return Err(ConversationError::InvalidDataUrl(format!(
                "unsupported media type `{media}`"
            )));
        }

        // Clients sometimes wrap long payloads; whitespace is not part of the alphabet.
        let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let data = general_purpose::STANDARD.decode(payload.as_bytes())?;
        Self::from_bytes(data, ImageSource::InlineBase64)
    }

    pub fn from_bytes(data: Vec<u8>, source: ImageSource) -> Result<Self, ConversationError> {
        let format = image::guess_format(&data)?;
        let pixels = image::load_from_memory_with_format(&data, format)?.to_rgb8();
        Ok(Self {
            data,
            format,
            pixels,
            source,
        })
    }

    /// Solid white placeholder, PNG encoded. Deterministic across calls.
    pub fn blank() -> Result<Self, ConversationError> {
        let pixels = RgbImage::from_pixel(BLANK_IMAGE_SIZE, BLANK_IMAGE_SIZE, Rgb([255, 255, 255]));
        let mut data = Vec::new();
        pixels.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)?;
        Ok(Self {
            data,
            format: ImageFormat::Png,
            pixels,
            source: ImageSource::Blank,
        })
    }
}
