use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::error::CompressionError;

/// Where the raw image comes from: a file picked from the gallery or a
/// camera frame already in memory.
#[derive(Debug, Clone)]
pub enum ImageRef {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionSettings {
    pub max_width: u32,
    pub initial_quality: u8,
    pub quality_step: u8,
    pub quality_floor: u8,
}

impl From<&ScanConfig> for CompressionSettings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            max_width: config.max_width,
            initial_quality: config.initial_quality,
            quality_step: config.quality_step,
            quality_floor: config.quality_floor,
        }
    }
}

/// JPEG payload ready for upload
#[derive(Debug, Clone)]
pub struct CompressedImage {
    pub data: Vec<u8>,
    pub quality: u8,
    /// Size estimate the target was checked against, see [`estimate_encoded_size`]
    pub estimated_size: usize,
    pub width: u32,
    pub height: u32,
    pub attempts: u32,
    /// False when the floor was reached before the target was met
    pub within_target: bool,
}

/// Approximates the byte size from the length of the base64 text form
/// (`len * 0.75`). All size thresholds are defined against this estimate.
pub fn estimate_encoded_size(byte_len: usize) -> usize {
    let text_len = base64::encoded_len(byte_len, true).unwrap_or(usize::MAX);
    text_len / 4 * 3
}

#[derive(Debug, Clone)]
pub struct ImageCompressor {
    settings: CompressionSettings,
}

impl ImageCompressor {
    pub fn new(settings: CompressionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    /// Load the image and compress it on the blocking pool
    pub async fn compress(
        &self,
        image: ImageRef,
        target_bytes: usize,
    ) -> Result<CompressedImage, CompressionError> {
        let data = match image {
            ImageRef::Path(path) => tokio::fs::read(&path).await?,
            ImageRef::Bytes(data) => data,
        };

        let compressor = self.clone();
        tokio::task::spawn_blocking(move || compressor.compress_bytes(&data, target_bytes))
            .await
            .map_err(|e| CompressionError::Worker(e.to_string()))?
    }

    /// Resize to the maximum width, then step JPEG quality down until the
    /// estimate fits `target_bytes` or the floor is reached. Missing the
    /// target is not an error; the smallest attempt is returned.
    pub fn compress_bytes(
        &self,
        data: &[u8],
        target_bytes: usize,
    ) -> Result<CompressedImage, CompressionError> {
        let img = image::load_from_memory(data)
            .map_err(|e| CompressionError::Decode(e.to_string()))?;
        let rgb = self.fit_width(img).to_rgb8();
        let (width, height) = rgb.dimensions();

        let floor = self.settings.quality_floor.clamp(1, 100);
        let step = self.settings.quality_step.max(1);
        let mut quality = self.settings.initial_quality.clamp(floor, 100);
        let mut attempts = 0;
        let mut best: Option<(Vec<u8>, u8, usize)> = None;

        loop {
            let encoded = encode_jpeg(&rgb, quality)?;
            attempts += 1;
            let estimated = estimate_encoded_size(encoded.len());
            debug!(
                "Compression attempt {}: quality={} estimated={} target={}",
                attempts, quality, estimated, target_bytes
            );

            let improves = best.as_ref().is_none_or(|(_, _, size)| estimated < *size);
            if improves {
                best = Some((encoded, quality, estimated));
            }

            if estimated <= target_bytes || quality <= floor {
                break;
            }
            quality = quality.saturating_sub(step).max(floor);
        }

        let (data, quality, estimated_size) = best.ok_or_else(|| CompressionError::Encode {
            quality,
            reason: "no encoding attempt was made".to_string(),
        })?;

        let within_target = estimated_size <= target_bytes;
        info!(
            "🗜️  Compressed scan to {}x{} at quality {} (~{} bytes, {} attempts, within target: {})",
            width, height, quality, estimated_size, attempts, within_target
        );

        Ok(CompressedImage {
            data,
            quality,
            estimated_size,
            width,
            height,
            attempts,
            within_target,
        })
    }

    fn fit_width(&self, img: DynamicImage) -> DynamicImage {
        let max_width = self.settings.max_width.max(1);
        if img.width() <= max_width {
            return img;
        }
        let height = (img.height() as u64 * max_width as u64 / img.width() as u64).max(1) as u32;
        img.resize_exact(max_width, height, FilterType::Triangle)
    }
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(rgb)
        .map_err(|e| CompressionError::Encode {
            quality,
            reason: e.to_string(),
        })?;
    Ok(out)
}
