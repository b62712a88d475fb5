//! Display implementations

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::{debug, info};

use super::{Display, DisplayError};
use crate::config::DisplayConfig;

/// Headless display: status text goes to the log
pub struct LogDisplay {
    width: u32,
    height: u32,
}

impl LogDisplay {
    pub fn new(config: &DisplayConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
        }
    }
}

impl Display for LogDisplay {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn draw_image(&mut self, pixels: &[u16], width: u32, height: u32) -> Result<(), DisplayError> {
        debug!("display: image {}x{} ({} px)", width, height, pixels.len());
        Ok(())
    }

    fn draw_text(&mut self, text: &str, _x: u32, _y: u32, _color: u16) -> Result<(), DisplayError> {
        info!("display: {}", text);
        Ok(())
    }
}

/// 16 bpp Linux framebuffer (e.g. an SPI TFT bound to fbtft)
///
/// Images are blitted row by row; there is no font, so text is unsupported.
pub struct FramebufferDisplay {
    file: File,
    width: u32,
    height: u32,
    /// Bytes per framebuffer row
    line_length: u32,
}

impl FramebufferDisplay {
    pub fn open(path: &Path, config: &DisplayConfig) -> Result<Self, DisplayError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        info!(
            "Framebuffer display {} ({}x{})",
            path.display(),
            config.width,
            config.height
        );
        Ok(Self {
            file,
            width: config.width,
            height: config.height,
            line_length: config.width * 2,
        })
    }
}

impl Display for FramebufferDisplay {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn draw_image(&mut self, pixels: &[u16], width: u32, height: u32) -> Result<(), DisplayError> {
        if pixels.len() != width as usize * height as usize {
            return Err(DisplayError::InvalidImage(format!(
                "{} pixels for {}x{}",
                pixels.len(),
                width,
                height
            )));
        }

        let cols = width.min(self.width) as usize;
        let mut row_buf = Vec::with_capacity(cols * 2);
        for y in 0..height.min(self.height) as usize {
            row_buf.clear();
            for px in &pixels[y * width as usize..y * width as usize + cols] {
                row_buf.extend_from_slice(&px.to_le_bytes());
            }
            self.file
                .write_all_at(&row_buf, y as u64 * self.line_length as u64)?;
        }
        Ok(())
    }

    fn draw_text(&mut self, _text: &str, _x: u32, _y: u32, _color: u16) -> Result<(), DisplayError> {
        Err(DisplayError::Unsupported("text"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_framebuffer_blit_clips() {
        let dir = TempDir::new().unwrap();
        let fb = dir.path().join("fb0");
        std::fs::write(&fb, vec![0u8; 4 * 2 * 2]).unwrap();

        let config = DisplayConfig {
            width: 4,
            height: 2,
            ..Default::default()
        };
        let mut display = FramebufferDisplay::open(&fb, &config).unwrap();

        // 5x3 image, only the top-left 4x2 lands on the panel
        let pixels: Vec<u16> = (0..15).collect();
        display.draw_image(&pixels, 5, 3).unwrap();

        let raw = std::fs::read(&fb).unwrap();
        let written: Vec<u16> = raw
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(written, vec![0, 1, 2, 3, 5, 6, 7, 8]);

        assert!(matches!(
            display.draw_text("F: 1.0MB", 2, 1, 0),
            Err(DisplayError::Unsupported(_))
        ));
    }

    #[test]
    fn test_log_display_accepts_everything() {
        let mut display = LogDisplay::new(&DisplayConfig::default());
        assert_eq!(display.dimensions(), (128, 128));
        assert!(display.draw_text("T: 1.0MB", 64, 97, 0x4E7F).is_ok());
        assert!(display.draw_image(&[0u16; 4], 2, 2).is_ok());
    }
}
