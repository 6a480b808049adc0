//! Host-side pixel buffers and numeric conversion.

use std::fmt;

use rayon::prelude::*;
use thiserror::Error;

/// Channel layout. Channels are positional: `R` is channel 0, `Rg` adds
/// channel 1 and so on. Only `Rgba` carries an alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    R,
    Rg,
    Rgb,
    Rgba,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::R => 1,
            PixelFormat::Rg => 2,
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
        }
    }

    /// Number of non-alpha channels.
    pub fn color_channels(self) -> usize {
        match self {
            PixelFormat::Rgba => 3,
            other => other.channels(),
        }
    }

    pub fn has_alpha(self) -> bool {
        self == PixelFormat::Rgba
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Float32,
    UInt8,
    UInt16,
}

impl ComponentType {
    /// Largest representable value of an integer component, `None` for float.
    pub fn max_value(self) -> Option<f32> {
        match self {
            ComponentType::Float32 => None,
            ComponentType::UInt8 => Some(u8::MAX as f32),
            ComponentType::UInt16 => Some(u16::MAX as f32),
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentType::Float32 => "float32",
            ComponentType::UInt8 => "uint8",
            ComponentType::UInt16 => "uint16",
        };
        f.write_str(name)
    }
}

/// Interleaved component storage, row-major, top row first.
#[derive(Debug, Clone, PartialEq)]
pub enum BitmapData {
    Float32(Vec<f32>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
}

impl BitmapData {
    pub fn len(&self) -> usize {
        match self {
            BitmapData::Float32(v) => v.len(),
            BitmapData::UInt8(v) => v.len(),
            BitmapData::UInt16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn component_type(&self) -> ComponentType {
        match self {
            BitmapData::Float32(_) => ComponentType::Float32,
            BitmapData::UInt8(_) => ComponentType::UInt8,
            BitmapData::UInt16(_) => ComponentType::UInt16,
        }
    }

    /// Component `i`, integers normalised to [0, 1].
    #[inline]
    fn normalized(&self, i: usize) -> f32 {
        match self {
            BitmapData::Float32(v) => v[i],
            BitmapData::UInt8(v) => v[i] as f32 / u8::MAX as f32,
            BitmapData::UInt16(v) => v[i] as f32 / u16::MAX as f32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitmapError {
    #[error("bitmap dimensions must be non-zero, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("bitmap data has {found} components, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },
}

/// A snapshot of pixel data in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    srgb_gamma: bool,
    data: BitmapData,
}

impl Bitmap {
    /// Wrap existing component data. `srgb_gamma` records whether color
    /// channels are sRGB-encoded (alpha is always linear).
    pub fn from_parts(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        srgb_gamma: bool,
        data: BitmapData,
    ) -> Result<Self, BitmapError> {
        if width == 0 || height == 0 {
            return Err(BitmapError::InvalidDimensions { width, height });
        }
        let expected = width as usize * height as usize * pixel_format.channels();
        if data.len() != expected {
            return Err(BitmapError::SizeMismatch {
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixel_format,
            srgb_gamma,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn component_type(&self) -> ComponentType {
        self.data.component_type()
    }

    pub fn srgb_gamma(&self) -> bool {
        self.srgb_gamma
    }

    pub fn data(&self) -> &BitmapData {
        &self.data
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            BitmapData::Float32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            BitmapData::UInt8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<&[u16]> {
        match &self.data {
            BitmapData::UInt16(v) => Some(v),
            _ => None,
        }
    }

    /// Normalised components of one pixel, or `None` outside the bitmap.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Vec<f32>> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let channels = self.pixel_format.channels();
        let base = (y as usize * self.width as usize + x as usize) * channels;
        Some((base..base + channels).map(|i| self.data.normalized(i)).collect())
    }

    /// Convert to another layout and component type.
    ///
    /// Integer targets clamp to [0, 1] and round to the nearest step. When
    /// `srgb_gamma` differs from the source flag, color channels are encoded
    /// (linear to sRGB) or decoded (sRGB to linear) first. Missing color
    /// channels are zero, missing alpha is one, surplus channels are dropped.
    /// Converting to the bitmap's own format is a plain copy.
    pub fn convert(&self, pixel_format: PixelFormat, component_type: ComponentType, srgb_gamma: bool) -> Bitmap {
        if pixel_format == self.pixel_format
            && component_type == self.component_type()
            && srgb_gamma == self.srgb_gamma
        {
            return self.clone();
        }

        let transfer: Option<fn(f32) -> f32> = match (self.srgb_gamma, srgb_gamma) {
            (false, true) => Some(linear_to_srgb),
            (true, false) => Some(srgb_to_linear),
            _ => None,
        };

        let width = self.width as usize;
        let src_channels = self.pixel_format.channels();
        let src_color = self.pixel_format.color_channels();
        let dst_channels = pixel_format.channels();
        let dst_color = pixel_format.color_channels();

        let mut values = vec![0.0f32; width * self.height as usize * dst_channels];
        values
            .par_chunks_mut(width * dst_channels)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.chunks_exact_mut(dst_channels).enumerate() {
                    let src = (y * width + x) * src_channels;
                    for (c, value) in out[..dst_color].iter_mut().enumerate() {
                        if c < src_color {
                            let v = self.data.normalized(src + c);
                            *value = transfer.map_or(v, |f| f(v));
                        }
                    }
                    if pixel_format.has_alpha() {
                        out[dst_color] = if self.pixel_format.has_alpha() {
                            self.data.normalized(src + src_color)
                        } else {
                            1.0
                        };
                    }
                }
            });

        let data = match component_type {
            ComponentType::Float32 => BitmapData::Float32(values),
            ComponentType::UInt8 => {
                BitmapData::UInt8(values.par_iter().map(|&v| quantize(v, u8::MAX as f32) as u8).collect())
            }
            ComponentType::UInt16 => {
                BitmapData::UInt16(values.par_iter().map(|&v| quantize(v, u16::MAX as f32) as u16).collect())
            }
        };

        Bitmap {
            width: self.width,
            height: self.height,
            pixel_format,
            srgb_gamma,
            data,
        }
    }
}

#[inline]
fn quantize(v: f32, max: f32) -> f32 {
    // NaN maps to zero.
    if v.is_nan() {
        return 0.0;
    }
    (v.clamp(0.0, 1.0) * max).round()
}

/// sRGB transfer function (IEC 61966-2-1), linear to encoded.
#[inline]
pub fn linear_to_srgb(v: f32) -> f32 {
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// Inverse of [`linear_to_srgb`].
#[inline]
pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rgba_f32(width: u32, height: u32, data: Vec<f32>) -> Bitmap {
        Bitmap::from_parts(width, height, PixelFormat::Rgba, false, BitmapData::Float32(data)).unwrap()
    }

    #[test]
    fn test_from_parts_validates() {
        assert_eq!(
            Bitmap::from_parts(0, 1, PixelFormat::R, false, BitmapData::UInt8(vec![])),
            Err(BitmapError::InvalidDimensions { width: 0, height: 1 })
        );
        assert_eq!(
            Bitmap::from_parts(2, 2, PixelFormat::Rgb, false, BitmapData::UInt8(vec![0; 11])),
            Err(BitmapError::SizeMismatch { expected: 12, found: 11 })
        );
    }

    #[test]
    fn test_float_to_u8_clamps_and_rounds() {
        let bitmap = rgba_f32(2, 1, vec![0.0, 0.5, 1.5, 0.25, -1.0, 1.0 / 255.0, 0.999, f32::NAN]);
        let rgb = bitmap.convert(PixelFormat::Rgb, ComponentType::UInt8, false);
        assert_eq!(rgb.pixel_format(), PixelFormat::Rgb);
        // Alpha dropped, 0.5 * 255 = 127.5 rounds up.
        assert_eq!(rgb.as_u8().unwrap(), &[0, 128, 255, 0, 1, 255]);
    }

    #[test]
    fn test_channel_expansion() {
        let gray = Bitmap::from_parts(1, 1, PixelFormat::R, false, BitmapData::UInt8(vec![51])).unwrap();
        let rgba = gray.convert(PixelFormat::Rgba, ComponentType::Float32, false);
        assert_eq!(rgba.as_f32().unwrap(), &[0.2, 0.0, 0.0, 1.0]);

        let rg = rgba_f32(1, 1, vec![0.1, 0.2, 0.3, 0.4]).convert(PixelFormat::Rg, ComponentType::Float32, false);
        assert_eq!(rg.as_f32().unwrap(), &[0.1, 0.2]);
    }

    #[test]
    fn test_alpha_is_not_gamma_encoded() {
        let bitmap = rgba_f32(1, 1, vec![0.5, 0.0, 1.0, 0.5]);
        let srgb = bitmap.convert(PixelFormat::Rgba, ComponentType::UInt8, true);
        assert!(srgb.srgb_gamma());
        // linear 0.5 encodes to ~0.7354
        assert_eq!(srgb.as_u8().unwrap(), &[188, 0, 255, 128]);
    }

    #[test]
    fn test_gamma_passthrough_when_flags_match() {
        let bitmap = Bitmap::from_parts(1, 1, PixelFormat::Rgb, true, BitmapData::UInt8(vec![10, 128, 250])).unwrap();
        let float = bitmap.convert(PixelFormat::Rgb, ComponentType::Float32, true);
        let back = float.convert(PixelFormat::Rgb, ComponentType::UInt8, true);
        assert_eq!(back, bitmap);
    }

    #[test]
    fn test_srgb_curve_inverse() {
        for i in 0..=100 {
            let v = i as f32 / 100.0;
            assert!((srgb_to_linear(linear_to_srgb(v)) - v).abs() < 1e-5);
        }
        assert_eq!(linear_to_srgb(0.0), 0.0);
        assert!((linear_to_srgb(1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pixel_lookup() {
        let bitmap = rgba_f32(2, 1, vec![0.0, 0.0, 0.0, 1.0, 0.5, 0.5, 0.0, 1.0]);
        assert_eq!(bitmap.pixel(1, 0), Some(vec![0.5, 0.5, 0.0, 1.0]));
        assert_eq!(bitmap.pixel(2, 0), None);
    }

    fn format_strategy() -> impl Strategy<Value = PixelFormat> {
        prop_oneof![
            Just(PixelFormat::R),
            Just(PixelFormat::Rg),
            Just(PixelFormat::Rgb),
            Just(PixelFormat::Rgba),
        ]
    }

    fn component_strategy() -> impl Strategy<Value = ComponentType> {
        prop_oneof![
            Just(ComponentType::Float32),
            Just(ComponentType::UInt8),
            Just(ComponentType::UInt16),
        ]
    }

    proptest! {
        #[test]
        fn prop_convert_idempotent(
            width in 1u32..6,
            height in 1u32..6,
            seed in prop::collection::vec(-0.5f32..1.5, 100),
            format in format_strategy(),
            component in component_strategy(),
            gamma in any::<bool>(),
        ) {
            let len = (width * height * 4) as usize;
            let data: Vec<f32> = seed.iter().cycle().take(len).copied().collect();
            let source = rgba_f32(width, height, data);

            let once = source.convert(format, component, gamma);
            let twice = once.convert(format, component, gamma);
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(once.data().len(), (width * height) as usize * format.channels());
        }

        #[test]
        fn prop_u8_survives_float_roundtrip(
            data in prop::collection::vec(any::<u8>(), 12),
            gamma in any::<bool>(),
        ) {
            let bitmap = Bitmap::from_parts(2, 2, PixelFormat::Rgb, gamma, BitmapData::UInt8(data)).unwrap();
            let float = bitmap.convert(PixelFormat::Rgb, ComponentType::Float32, gamma);
            prop_assert_eq!(float.convert(PixelFormat::Rgb, ComponentType::UInt8, gamma), bitmap);
        }
    }
}
