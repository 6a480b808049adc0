//! PNG export and import.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use thiserror::Error;

use super::bitmap::{Bitmap, BitmapData, BitmapError, ComponentType, PixelFormat};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported image extension '{0}' (expected png)")]
    UnsupportedExtension(String),

    #[error("cannot encode {0} components, convert to uint8 or uint16 first")]
    UnsupportedComponent(ComponentType),

    #[error("PNG encoding failed: {0}")]
    Encoding(#[from] png::EncodingError),

    #[error("PNG decoding failed: {0}")]
    Decoding(#[from] png::DecodingError),

    #[error("unsupported PNG layout: {0}")]
    UnsupportedLayout(String),

    #[error("decoded image is malformed: {0}")]
    Malformed(#[from] BitmapError),
}

fn check_extension(path: &Path) -> Result<(), ExportError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    if ext.eq_ignore_ascii_case("png") {
        Ok(())
    } else {
        Err(ExportError::UnsupportedExtension(ext.to_string()))
    }
}

fn color_type(format: PixelFormat) -> png::ColorType {
    match format {
        PixelFormat::R => png::ColorType::Grayscale,
        PixelFormat::Rg => png::ColorType::GrayscaleAlpha,
        PixelFormat::Rgb => png::ColorType::Rgb,
        PixelFormat::Rgba => png::ColorType::Rgba,
    }
}

impl Bitmap {
    /// Encode to an in-memory PNG. Integer component types only.
    pub fn encode_png(&self) -> Result<Vec<u8>, ExportError> {
        let (depth, samples) = match self.data() {
            BitmapData::UInt8(v) => (png::BitDepth::Eight, v.clone()),
            // PNG stores 16-bit samples big-endian.
            BitmapData::UInt16(v) => (
                png::BitDepth::Sixteen,
                v.iter().flat_map(|s| s.to_be_bytes()).collect(),
            ),
            BitmapData::Float32(_) => {
                return Err(ExportError::UnsupportedComponent(ComponentType::Float32));
            }
        };

        let mut bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut bytes, self.width(), self.height());
            encoder.set_color(color_type(self.pixel_format()));
            encoder.set_depth(depth);
            let mut writer = encoder.write_header()?;
            writer.write_image_data(&samples)?;
            writer.finish()?;
        }
        Ok(bytes)
    }

    /// Write as PNG, choosing the format from the extension.
    ///
    /// The image is fully encoded before the file is created, and the parent
    /// directory must already exist.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ExportError> {
        let path = path.as_ref();
        check_extension(path)?;
        let bytes = self.encode_png()?;
        fs::write(path, &bytes)?;
        log::info!(
            "Wrote {}x{} {:?} image to '{}' ({} bytes)",
            self.width(),
            self.height(),
            self.pixel_format(),
            path.display(),
            bytes.len()
        );
        Ok(())
    }

    /// Decode an in-memory PNG. Palette and low bit-depth images are expanded.
    pub fn decode_png(bytes: &[u8]) -> Result<Bitmap, ExportError> {
        let mut decoder = png::Decoder::new(Cursor::new(bytes));
        decoder.set_transformations(png::Transformations::EXPAND);
        let mut reader = decoder.read_info()?;

        let (width, height) = (reader.info().width, reader.info().height);
        let (color, depth) = reader.output_color_type();
        let pixel_format = match color {
            png::ColorType::Grayscale => PixelFormat::R,
            png::ColorType::GrayscaleAlpha => PixelFormat::Rg,
            png::ColorType::Rgb => PixelFormat::Rgb,
            png::ColorType::Rgba => PixelFormat::Rgba,
            other => return Err(ExportError::UnsupportedLayout(format!("{other:?}"))),
        };

        let size = reader
            .output_buffer_size()
            .ok_or_else(|| ExportError::UnsupportedLayout(format!("{width}x{height} frame")))?;
        let mut buf = vec![0u8; size];
        let frame = reader.next_frame(&mut buf)?;
        buf.truncate(frame.buffer_size());

        let data = match depth {
            png::BitDepth::Sixteen => BitmapData::UInt16(
                buf.chunks_exact(2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .collect(),
            ),
            png::BitDepth::Eight => BitmapData::UInt8(buf),
            other => return Err(ExportError::UnsupportedLayout(format!("{other:?} bit depth"))),
        };

        Ok(Bitmap::from_parts(width, height, pixel_format, true, data)?)
    }

    /// Read a PNG file.
    pub fn read(path: impl AsRef<Path>) -> Result<Bitmap, ExportError> {
        let path = path.as_ref();
        check_extension(path)?;
        let bytes = fs::read(path)?;
        let bitmap = Self::decode_png(&bytes)?;
        log::debug!(
            "Read {}x{} {:?} image from '{}'",
            bitmap.width(),
            bitmap.height(),
            bitmap.pixel_format(),
            path.display()
        );
        Ok(bitmap)
    }
}
