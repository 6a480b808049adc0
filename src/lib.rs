//! GPU kernel runner - a minimal compute pipeline over wgpu.
//!
//! Create a [`Device`], allocate image resources on it, compile a WGSL
//! program, bind one entry point to a [`KernelSchema`] and dispatch it over
//! a thread grid. Results are copied back as a [`Bitmap`], converted and
//! written to PNG or shown in a display sink.
//!
//! # Architecture
//!
//! - `schema`: host-side declarations (render config, kernel parameter schemas)
//! - `compute::gpu`: device, resources, programs, kernels, command recording
//! - `image`: bitmaps, pixel conversion, PNG files, display sinks
//! - `pipeline`: the single-shot render used by the CLI
//!
//! # Example
//!
//! ```rust,no_run
//! use gpu_kernel_runner::{
//!     compute::gpu::{Device, DeviceOptions, ResourceDesc, ResourceFormat, ResourceUsage},
//!     image::{ComponentType, PixelFormat},
//!     pipeline::{uv_schema, BASIC_UV_SHADER},
//!     schema::{Bindings, Value},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut device = Device::new_blocking(DeviceOptions::default())?;
//!
//! let desc = ResourceDesc::new(
//!     ResourceFormat::Rgba32Float,
//!     64,
//!     64,
//!     ResourceUsage::SHADER_READ | ResourceUsage::SHADER_WRITE,
//! );
//! let output = device.create_resource_filled(&desc, 1.0)?;
//!
//! let program = device.load_program_from_source("basic_uv.wgsl", BASIC_UV_SHADER, &["main"])?;
//! let kernel = device.create_kernel(program, "main", uv_schema())?;
//!
//! let mut encoder = device.create_command_encoder();
//! encoder.dispatch(
//!     kernel,
//!     [64, 64, 1],
//!     &Bindings::new()
//!         .set("Params", "Dimensions", Value::UInt2([64, 64]))
//!         .set("Params", "OutTexture", output),
//! )?;
//! let handle = device.submit(encoder.finish());
//! device.wait(Some(&handle))?;
//!
//! device
//!     .to_bitmap(output)?
//!     .convert(PixelFormat::Rgb, ComponentType::UInt8, false)
//!     .write("uv.png")?;
//! # Ok(())
//! # }
//! ```

pub mod compute;
pub mod image;
pub mod pipeline;
pub mod schema;

// Re-export commonly used types
pub use compute::gpu::{Device, DeviceOptions, GpuError, KernelId, ResourceId};
pub use image::{Bitmap, ComponentType, PixelFormat};
pub use pipeline::{RunError, render};
pub use schema::{Bindings, KernelSchema, RenderConfig};
