use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageError, ImageReader};
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

use super::retry::{ErrorKind, ProviderError};

pub const CANONICAL_MIME: &str = "image/jpeg";
const JPEG_QUALITY: u8 = 85;

/// A source or reference image ready to embed in a provider request.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    /// Dimensions after orientation is applied, before downscaling.
    pub source_width: u32,
    pub source_height: u32,
}

impl PreparedImage {
    pub fn source_dimensions(&self) -> (u32, u32) {
        (self.source_width, self.source_height)
    }
}

/// Downloads `url`, classifying failures the same way provider calls are.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Vec<u8>, ProviderError> {
    let context = format!("failed to fetch image {url}");
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| ProviderError::transport(&context, &err))?;

    let status = response.status();
    if !status.is_success() {
        let reason = status.canonical_reason().unwrap_or("error");
        let kind = if status.is_server_error() {
            ErrorKind::Transient
        } else {
            ErrorKind::Rejected
        };
        return Err(ProviderError {
            kind,
            status: Some(status.as_u16()),
            message: format!("{context}: HTTP {} {reason}", status.as_u16()),
            raw: serde_json::Value::Null,
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| ProviderError::transport(&context, &err))?;
    debug!(message = "Fetched image", url, bytes = bytes.len());
    Ok(bytes.to_vec())
}

/// Decodes, applies EXIF orientation, shrinks to `max_edge` on the long side
/// and re-encodes as JPEG.
pub fn prepare(bytes: &[u8], max_edge: u32) -> Result<PreparedImage, ImageError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);

    let (source_width, source_height) = (img.width(), img.height());
    if source_width.max(source_height) > max_edge {
        img = img.resize(max_edge, max_edge, FilterType::Triangle);
    }

    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img.to_rgb8())
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))?;

    Ok(PreparedImage {
        bytes: out,
        mime_type: CANONICAL_MIME,
        source_width,
        source_height,
    })
}

/// Fetches and prepares an image, running the decode off the async runtime.
pub async fn fetch_prepared(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    max_edge: u32,
) -> Result<PreparedImage, ProviderError> {
    let bytes = fetch(client, url, timeout).await?;
    let prepared = tokio::task::spawn_blocking(move || prepare(&bytes, max_edge))
        .await
        .map_err(|err| ProviderError::new(ErrorKind::Rejected, format!("image task failed: {err}")))?;
    prepared.map_err(|err| {
        ProviderError::new(
            ErrorKind::Rejected,
            format!("image {url} could not be decoded: {err}"),
        )
    })
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 120, 40]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}
