//! Display sinks: places a named bitmap snapshot can be sent for viewing.

use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;

use thiserror::Error;

use super::bitmap::{Bitmap, ComponentType, PixelFormat};
use super::png::ExportError;

/// Default address of a locally running tev instance.
pub const TEV_DEFAULT_ADDRESS: &str = "127.0.0.1:14158";

const TEV_UPDATE_IMAGE: u8 = 3;
const TEV_CREATE_IMAGE: u8 = 4;
const CHANNEL_NAMES: [&str; 4] = ["R", "G", "B", "A"];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to connect to viewer at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("viewer connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("image too large for viewer protocol: {0} bytes")]
    TooLarge(usize),
}

/// Accepts a labelled bitmap snapshot.
pub trait DisplaySink {
    fn show(&mut self, label: &str, bitmap: &Bitmap) -> Result<(), SinkError>;
}

/// Streams images to the tev HDR viewer over its TCP protocol.
///
/// The connection is opened on first use and kept for later images.
pub struct TevSink {
    address: String,
    stream: Option<TcpStream>,
    grab_focus: bool,
}

impl TevSink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: None,
            grab_focus: true,
        }
    }

    pub fn with_grab_focus(mut self, grab_focus: bool) -> Self {
        self.grab_focus = grab_focus;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn stream(&mut self) -> Result<&mut TcpStream, SinkError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.address).map_err(|source| SinkError::Connect {
                address: self.address.clone(),
                source,
            })?;
            log::debug!("Connected to tev at {}", self.address);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| SinkError::Io(std::io::ErrorKind::NotConnected.into()))
    }
}

impl Default for TevSink {
    fn default() -> Self {
        Self::new(TEV_DEFAULT_ADDRESS)
    }
}

impl DisplaySink for TevSink {
    fn show(&mut self, label: &str, bitmap: &Bitmap) -> Result<(), SinkError> {
        // tev displays linear float data.
        let linear = bitmap.convert(bitmap.pixel_format(), ComponentType::Float32, false);
        let channels = linear.pixel_format().channels();
        let (width, height) = (linear.width(), linear.height());
        let values = linear.as_f32().unwrap_or_default();

        let mut packets = vec![create_image_packet(
            self.grab_focus,
            label,
            width,
            height,
            &CHANNEL_NAMES[..channels],
        )?];
        for (c, name) in CHANNEL_NAMES[..channels].iter().enumerate() {
            let plane: Vec<f32> = values.iter().skip(c).step_by(channels).copied().collect();
            packets.push(update_image_packet(false, label, name, width, height, &plane)?);
        }

        let result = (|| -> Result<(), SinkError> {
            let stream = self.stream()?;
            for packet in &packets {
                stream.write_all(packet)?;
            }
            stream.flush()?;
            Ok(())
        })();
        if result.is_err() {
            // Reconnect on the next image.
            self.stream = None;
        } else {
            log::debug!("Sent '{label}' ({width}x{height}, {channels} channels) to tev");
        }
        result
    }
}

struct Packet(Vec<u8>);

impl Packet {
    fn new(kind: u8) -> Self {
        // Length prefix is patched in `finish`.
        let mut bytes = vec![0u8; 4];
        bytes.push(kind);
        Packet(bytes)
    }

    fn bool(&mut self, v: bool) {
        self.0.push(v as u8);
    }

    fn string(&mut self, s: &str) {
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(0);
    }

    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn dim(&mut self, v: u32) -> Result<(), SinkError> {
        let v = i32::try_from(v).map_err(|_| SinkError::TooLarge(v as usize))?;
        self.i32(v);
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<u8>, SinkError> {
        let len = u32::try_from(self.0.len()).map_err(|_| SinkError::TooLarge(self.0.len()))?;
        self.0[..4].copy_from_slice(&len.to_le_bytes());
        Ok(self.0)
    }
}

fn create_image_packet(
    grab_focus: bool,
    name: &str,
    width: u32,
    height: u32,
    channels: &[&str],
) -> Result<Vec<u8>, SinkError> {
    let mut packet = Packet::new(TEV_CREATE_IMAGE);
    packet.bool(grab_focus);
    packet.string(name);
    packet.dim(width)?;
    packet.dim(height)?;
    packet.i32(channels.len() as i32);
    for channel in channels {
        packet.string(channel);
    }
    packet.finish()
}

fn update_image_packet(
    grab_focus: bool,
    name: &str,
    channel: &str,
    width: u32,
    height: u32,
    plane: &[f32],
) -> Result<Vec<u8>, SinkError> {
    let mut packet = Packet::new(TEV_UPDATE_IMAGE);
    packet.bool(grab_focus);
    packet.string(name);
    packet.string(channel);
    packet.i32(0);
    packet.i32(0);
    packet.dim(width)?;
    packet.dim(height)?;
    packet.0.extend(plane.iter().flat_map(|v| v.to_le_bytes()));
    packet.finish()
}

/// Writes each snapshot to `<dir>/<label>.png` as 8-bit RGB.
pub struct FileSink {
    dir: PathBuf,
    srgb_gamma: bool,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            srgb_gamma: true,
        }
    }

    pub fn with_srgb_gamma(mut self, srgb_gamma: bool) -> Self {
        self.srgb_gamma = srgb_gamma;
        self
    }

    pub fn path_for(&self, label: &str) -> PathBuf {
        let stem: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{stem}.png"))
    }
}

impl DisplaySink for FileSink {
    fn show(&mut self, label: &str, bitmap: &Bitmap) -> Result<(), SinkError> {
        let rgb = bitmap.convert(PixelFormat::Rgb, ComponentType::UInt8, self.srgb_gamma);
        rgb.write(self.path_for(label))?;
        Ok(())
    }
}
