// QR Code Files
//
// Rendering of login QR payloads for the terminal and as PNG images served
// over HTTP while a login is pending.

use image::Luma;
use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Edge length of written PNG images, in pixels
pub const QR_IMAGE_SIZE: u32 = 256;

#[derive(Debug, Error)]
pub enum QrError {
    #[error("qr encode error: {0}")]
    Encode(#[from] qrcode::types::QrError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maps session ids to QR image paths
#[derive(Debug, Clone)]
pub struct QrFileResolver {
    dir: PathBuf,
}

impl QrFileResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("qr_{}.png", session_id))
    }
}

fn encode(payload: &str) -> Result<QrCode, QrError> {
    Ok(QrCode::with_error_correction_level(
        payload.as_bytes(),
        EcLevel::M,
    )?)
}

/// Unicode half-block rendering for a terminal
pub fn render_terminal(payload: &str) -> Result<String, QrError> {
    let code = encode(payload)?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

/// Write a PNG of `payload` to `path`, creating parent directories.
pub fn write_png(payload: &str, path: &Path) -> Result<(), QrError> {
    let code = encode(payload)?;
    let image = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_IMAGE_SIZE, QR_IMAGE_SIZE)
        .build();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// Best-effort removal; a missing file is fine.
pub async fn remove_png(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "qr image removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "failed to remove qr image: {}", e),
    }
}
