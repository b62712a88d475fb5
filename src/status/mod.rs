//! Status output
//!
//! Shows a splash image while booting and the free/total capacity of the
//! medium once the inventory is done. Display failures never stop the boot;
//! they are logged and dropped here.

pub mod display;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::arbiter::OwnershipMode;
use crate::config::DisplayConfig;

pub use display::{FramebufferDisplay, LogDisplay};

/// RGB565 green
pub const COLOR_FREE: u16 = 0x07E0;
/// RGB565 light blue
pub const COLOR_TOTAL: u16 = 0x4E7F;

/// Baselines of the two capacity lines on a 128x128 panel
const FREE_LINE_Y: u32 = 52;
const TOTAL_LINE_Y: u32 = 97;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output device for status images and text
pub trait Display: Send {
    /// (width, height) in pixels
    fn dimensions(&self) -> (u32, u32);

    /// Blit a full RGB565 image at the origin
    fn draw_image(&mut self, pixels: &[u16], width: u32, height: u32) -> Result<(), DisplayError>;

    /// Draw `text` horizontally centred on `x`, with its baseline at `y`
    fn draw_text(&mut self, text: &str, x: u32, y: u32, color: u16) -> Result<(), DisplayError>;
}

impl<D: Display + ?Sized> Display for Box<D> {
    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }

    fn draw_image(&mut self, pixels: &[u16], width: u32, height: u32) -> Result<(), DisplayError> {
        (**self).draw_image(pixels, width, height)
    }

    fn draw_text(&mut self, text: &str, x: u32, y: u32, color: u16) -> Result<(), DisplayError> {
        (**self).draw_text(text, x, y, color)
    }
}

/// Pick the configured display, falling back to the log
pub fn open_display(config: &crate::config::DisplayConfig) -> Box<dyn Display> {
    if let Some(path) = config.framebuffer.as_deref().filter(|p| !p.is_empty()) {
        match FramebufferDisplay::open(Path::new(path), config) {
            Ok(fb) => return Box::new(fb),
            Err(e) => warn!("Framebuffer {} unavailable, logging status instead: {}", path, e),
        }
    }
    Box::new(LogDisplay::new(config))
}

/// Which splash image to show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplashStage {
    Boot,
    Ready,
}

/// Capacity figures at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub mode: OwnershipMode,
    pub taken_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn new(total_bytes: u64, free_bytes: u64, mode: OwnershipMode) -> Self {
        Self {
            free_bytes,
            total_bytes,
            mode,
            taken_at: Utc::now(),
        }
    }

    pub fn free_mb(&self) -> f64 {
        self.free_bytes as f64 / BYTES_PER_MB
    }

    pub fn total_mb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_MB
    }

    /// "F: 12.3MB"
    pub fn free_line(&self) -> String {
        format!("F: {:.1}MB", self.free_mb())
    }

    /// "T: 29.7MB"
    pub fn total_line(&self) -> String {
        format!("T: {:.1}MB", self.total_mb())
    }
}

/// Raw RGB565 image, little endian, exactly width x height pixels
pub fn load_rgb565(path: &Path, width: u32, height: u32) -> Result<Vec<u16>, DisplayError> {
    let bytes = std::fs::read(path)?;
    let expected = width as usize * height as usize * 2;
    if bytes.len() != expected {
        return Err(DisplayError::InvalidImage(format!(
            "{} is {} bytes, expected {} for {}x{}",
            path.display(),
            bytes.len(),
            expected,
            width,
            height
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|px| u16::from_le_bytes([px[0], px[1]]))
        .collect())
}

/// Draws boot progress and capacity onto a [`Display`]
pub struct StatusReporter<D> {
    display: D,
    boot_image: Option<Vec<u16>>,
    ready_image: Option<Vec<u16>>,
}

impl<D: Display> StatusReporter<D> {
    pub fn new(display: D) -> Self {
        Self {
            display,
            boot_image: None,
            ready_image: None,
        }
    }

    /// Load the splash images named in `config`; unreadable images are skipped
    pub fn with_images(mut self, config: &DisplayConfig) -> Self {
        let (width, height) = self.display.dimensions();
        let load = |path: &Option<String>| {
            let path = path.as_deref().filter(|p| !p.is_empty())?;
            match load_rgb565(Path::new(path), width, height) {
                Ok(pixels) => Some(pixels),
                Err(e) => {
                    warn!("Splash image ignored: {}", e);
                    None
                }
            }
        };
        self.boot_image = load(&config.boot_image);
        self.ready_image = load(&config.ready_image);
        self
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn splash(&mut self, stage: SplashStage) {
        let image = match stage {
            SplashStage::Boot => self.boot_image.as_deref(),
            SplashStage::Ready => self.ready_image.as_deref(),
        };
        let Some(pixels) = image else {
            return;
        };
        let (width, height) = self.display.dimensions();
        if let Err(e) = self.display.draw_image(pixels, width, height) {
            warn!("Display: failed to draw {:?} image: {}", stage, e);
        }
    }

    /// Show free and total capacity
    pub fn render(&mut self, snapshot: &StatusSnapshot) {
        info!(
            "Storage {:?}: {:.1} MB free of {:.1} MB",
            snapshot.mode,
            snapshot.free_mb(),
            snapshot.total_mb()
        );

        let center = self.display.dimensions().0 / 2;
        let lines = [
            (snapshot.free_line(), FREE_LINE_Y, COLOR_FREE),
            (snapshot.total_line(), TOTAL_LINE_Y, COLOR_TOTAL),
        ];
        for (text, y, color) in lines {
            match self.display.draw_text(&text, center, y, color) {
                Ok(()) => {}
                Err(DisplayError::Unsupported(what)) => {
                    tracing::debug!("Display has no {} support, skipping '{}'", what, text);
                }
                Err(e) => warn!("Display: failed to draw '{}': {}", text, e),
            }
        }
    }
}
