use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage};
use tracing::{debug, info};

use crate::enhance::{prepare_for_print, Adjust};

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;
/// Rows sent per raster command; many printers cap the band height.
const BAND_ROWS: u32 = 255;
const FEED_LINES: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum PrintError {
    #[error("printer unavailable: {0}")]
    Unavailable(String),
    #[error("printer I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to load image for printing: {0}")]
    Image(#[from] image::ImageError),
}

/// Something that can put a black-and-white image on paper.
pub trait Printer: Send + Sync {
    /// `img` holds 0 for black dots and 255 for white.
    fn print(&self, img: &GrayImage) -> Result<(), PrintError>;
}

/// ESC/POS thermal printer behind a character device such as `/dev/usb/lp0`.
#[derive(Debug, Clone)]
pub struct EscPosPrinter {
    device: PathBuf,
    cut: bool,
}

impl EscPosPrinter {
    pub fn new(device: impl Into<PathBuf>, cut: bool) -> Self {
        Self {
            device: device.into(),
            cut,
        }
    }
}

impl Printer for EscPosPrinter {
    fn print(&self, img: &GrayImage) -> Result<(), PrintError> {
        let mut dev = OpenOptions::new().write(true).open(&self.device).map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    PrintError::Unavailable(format!("{}: {e}", self.device.display()))
                }
                _ => PrintError::Io(e),
            }
        })?;
        let job = encode_job(img, self.cut);
        dev.write_all(&job)?;
        dev.flush()?;
        debug!(device = %self.device.display(), bytes = job.len(), "print job sent");
        Ok(())
    }
}

/// Stand-in used when printing is switched off in the config.
#[derive(Debug, Default, Clone)]
pub struct DisabledPrinter;

impl Printer for DisabledPrinter {
    fn print(&self, _img: &GrayImage) -> Result<(), PrintError> {
        Err(PrintError::Unavailable("printing disabled".into()))
    }
}

/// Build the full ESC/POS byte stream for one image.
pub fn encode_job(img: &GrayImage, cut: bool) -> Vec<u8> {
    let (width, height) = img.dimensions();
    let row_bytes = width.div_ceil(8);
    let mut out = Vec::with_capacity((row_bytes * height) as usize + 64);

    // Initialise.
    out.extend_from_slice(&[ESC, b'@']);

    let mut y0 = 0;
    while y0 < height {
        let rows = BAND_ROWS.min(height - y0);
        // GS v 0: raster bit image, normal density.
        out.extend_from_slice(&[GS, b'v', b'0', 0]);
        out.extend_from_slice(&(row_bytes as u16).to_le_bytes());
        out.extend_from_slice(&(rows as u16).to_le_bytes());
        for y in y0..y0 + rows {
            for xb in 0..row_bytes {
                let mut byte = 0u8;
                for bit in 0..8 {
                    let x = xb * 8 + bit;
                    if x < width && img.get_pixel(x, y).0[0] < 128 {
                        byte |= 0x80 >> bit;
                    }
                }
                out.push(byte);
            }
        }
        y0 += rows;
    }

    // Feed past the tear bar, then partial cut.
    out.extend_from_slice(&[ESC, b'd', FEED_LINES]);
    if cut {
        out.extend_from_slice(&[GS, b'V', 66, 0]);
    }
    out
}

pub fn print_image(
    printer: &dyn Printer,
    img: &DynamicImage,
    adjust: Adjust,
    width: u32,
) -> Result<(), PrintError> {
    let prepared = prepare_for_print(img, adjust, width);
    printer.print(&prepared)
}

/// Print a stored photo. The file itself is only read.
pub fn print_file(
    printer: &dyn Printer,
    path: &Path,
    adjust: Adjust,
    width: u32,
) -> Result<(), PrintError> {
    let img = image::open(path)?;
    print_image(printer, &img, adjust, width)?;
    info!(path = %path.display(), "printed photo");
    Ok(())
}
