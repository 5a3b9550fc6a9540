//! QR code collaborator.
//!
//! Encoded datagrams ride as QR tiles inside uploaded photos. Tiles are
//! rendered and composed into grid images in-process; scanning downloaded
//! photos goes through the external `zbarimg` binary under a hard timeout.
//! Scratch image files live in `qr.saveDir` (or the system temp dir).

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use image::{GrayImage, ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use rand::Rng;
use thiserror::Error;
use tokio::process::Command;

use crate::config::QrConfig;

/// Byte-mode capacity per error-correction level (L, M, Q, H).
const MAX_CONTENT_LEN: [usize; 4] = [2953, 2331, 1663, 1273];

const EC_LEVELS: [EcLevel; 4] = [EcLevel::L, EcLevel::M, EcLevel::Q, EcLevel::H];

#[derive(Debug, Error)]
pub enum QrError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zbarimg timed out")]
    Timeout,

    #[error("qr code is not detected")]
    NotDetected,

    #[error("content too large: {0} > {1}")]
    TooLarge(usize, usize),

    #[error("encode: {0}")]
    Encode(String),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("zbarimg: {0}")]
    Tool(String),
}

pub struct QrCodec {
    cfg: QrConfig,
}

impl QrCodec {
    pub fn new(cfg: QrConfig) -> Self {
        Self { cfg }
    }

    fn level_index(&self) -> usize {
        (self.cfg.image_level as usize).min(EC_LEVELS.len() - 1)
    }

    /// Longest content a single tile can hold at the configured level.
    pub fn max_content_len(&self) -> usize {
        MAX_CONTENT_LEN[self.level_index()]
    }

    /// Capacity of a given level, for the method descriptor table.
    pub fn level_capacity(level: u8) -> usize {
        MAX_CONTENT_LEN[(level as usize).min(MAX_CONTENT_LEN.len() - 1)]
    }

    /// Render `content` into a PNG tile no larger than the configured
    /// image size.
    pub fn encode(&self, content: &str) -> Result<Vec<u8>, QrError> {
        let max = self.max_content_len();

        if content.len() > max {
            return Err(QrError::TooLarge(content.len(), max));
        }

        let code =
            QrCode::with_error_correction_level(content.as_bytes(), EC_LEVELS[self.level_index()])
                .map_err(|err| QrError::Encode(err.to_string()))?;

        let size = self.cfg.image_size;
        let tile = code
            .render::<Luma<u8>>()
            .max_dimensions(size, size)
            .build();

        png_bytes(&tile)
    }

    /// Scan an image file, returning every QR content string found.
    pub async fn decode(&self, file: &Path) -> Result<Vec<String>, QrError> {
        let child = Command::new(&self.cfg.zbar_path)
            .arg(file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = tokio::time::timeout(self.cfg.zbar_timeout(), child.wait_with_output())
            .await
            .map_err(|_| QrError::Timeout)??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            if stderr.contains("scanned 0 barcode symbols") {
                return Err(QrError::NotDetected);
            }

            return Err(QrError::Tool(stderr));
        }

        let content: Vec<String> = stdout
            .lines()
            .filter_map(|line| line.strip_prefix("QR-Code:"))
            .map(str::to_string)
            .collect();

        if content.is_empty() {
            return Err(QrError::NotDetected);
        }

        Ok(content)
    }

    /// Compose N tiles onto a white ceil(sqrt(N))-column grid, one
    /// image-size cell per tile.
    pub fn merge(&self, tiles: &[Vec<u8>]) -> Result<Vec<u8>, QrError> {
        if tiles.is_empty() {
            return Err(QrError::Encode("no tiles".to_string()));
        }

        let size = self.cfg.image_size;
        let cols = grid_cols(tiles.len());
        let rows = tiles.len().div_ceil(cols);

        let mut merged = GrayImage::from_pixel(
            cols as u32 * size,
            rows as u32 * size,
            Luma([u8::MAX]),
        );

        for (i, data) in tiles.iter().enumerate() {
            let tile = image::load_from_memory(data)?.to_luma8();

            let x = (i % cols) as i64 * i64::from(size);
            let y = (i / cols) as i64 * i64::from(size);

            image::imageops::overlay(&mut merged, &tile, x, y);
        }

        png_bytes(&merged)
    }

    /// Write scratch image data to a uniquely named file and return its path.
    pub fn save(&self, data: &[u8], ext: &str) -> Result<PathBuf, QrError> {
        let path = self.scratch_path(ext);
        std::fs::write(&path, data)?;

        Ok(path)
    }

    fn scratch_path(&self, ext: &str) -> PathBuf {
        let dir = if self.cfg.save_dir.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(&self.cfg.save_dir)
        };

        let tag: u64 = rand::thread_rng().gen();

        dir.join(format!("qr-{:016x}.{ext}", tag))
    }

    /// Startup round-trip check: a rendered tile must scan back through the
    /// external toolchain.
    pub async fn self_test(&self) -> Result<(), QrError> {
        let content = "test";
        let tile = self.encode(content)?;
        let file = self.save(&tile, "png")?;
        let decoded = self.decode(&file).await;
        let _ = std::fs::remove_file(&file);

        match decoded?.as_slice() {
            [only] if only.as_str() == content => Ok(()),
            other => Err(QrError::Tool(format!("self test mismatch: {other:?}"))),
        }
    }
}

fn png_bytes(img: &GrayImage) -> Result<Vec<u8>, QrError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;

    Ok(buf.into_inner())
}

/// Columns of the merged grid: tiles are laid out ceil(sqrt(N)) wide.
pub fn grid_cols(n: usize) -> usize {
    let mut side = 1;

    while side * side < n {
        side += 1;
    }

    side
}
