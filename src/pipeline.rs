//! Single-shot render: compile once, dispatch over the output, read back.

use std::time::Instant;

use crate::compute::gpu::{
    Device, GpuError, ResourceDesc, ResourceFormat, ResourceId, ResourceUsage, Stage,
};
use crate::image::{Bitmap, ComponentType, DisplaySink, ExportError, PixelFormat, SinkError};
use crate::schema::{Access, Bindings, ConfigError, FieldType, KernelSchema, ParameterBlock, RenderConfig, Value, ValueType};

/// Bundled UV visualisation shader with entry points `main` and `Identity`.
pub const BASIC_UV_SHADER: &str = include_str!("compute/gpu/shaders/basic_uv.wgsl");

/// Name of the single parameter block the render kernels take.
pub const PARAMS_BLOCK: &str = "Params";

/// Errors from a render run, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

impl RunError {
    pub fn stage(&self) -> Stage {
        match self {
            RunError::Config(_) => Stage::Config,
            RunError::Gpu(e) => e.stage(),
            RunError::Export(_) | RunError::Sink(_) => Stage::Export,
        }
    }
}

/// Schema of the render kernels: output size and the output image.
pub fn uv_schema() -> KernelSchema {
    KernelSchema::new().block(
        ParameterBlock::new(PARAMS_BLOCK)
            .field("Dimensions", FieldType::Uniform(ValueType::UInt2))
            .field("OutTexture", FieldType::StorageTexture(Access::Write)),
    )
}

/// Run the configured kernel and return the raw RGBA float readback.
pub fn render_raw(config: &RenderConfig) -> Result<Bitmap, RunError> {
    config.validate()?;
    let start = Instant::now();

    let mut device = Device::new_blocking(config.device_options())?;

    let desc = ResourceDesc::new(
        ResourceFormat::Rgba32Float,
        config.width,
        config.height,
        ResourceUsage::SHADER_READ | ResourceUsage::SHADER_WRITE,
    )
    .with_label("OutTexture");
    let fill = config.fill.repeat(config.texel_count());
    let output = device.create_resource(&desc, &fill)?;

    let entry_point = config.entry_point.as_str();
    let program = match &config.shader {
        Some(path) => device.load_program(path, &[entry_point])?,
        None => device.load_program_from_source("basic_uv.wgsl", BASIC_UV_SHADER, &[entry_point])?,
    };
    let kernel = device.create_kernel(program, entry_point, uv_schema())?;

    let bindings = Bindings::new()
        .set(PARAMS_BLOCK, "Dimensions", Value::UInt2([config.width, config.height]))
        .set(PARAMS_BLOCK, "OutTexture", output);

    let mut encoder = device.create_command_encoder();
    encoder.dispatch(kernel, [config.width, config.height, 1], &bindings)?;
    let handle = device.submit(encoder.finish());
    device.wait(Some(&handle))?;
    device.flush_log()?;

    let bitmap = device.to_bitmap(output)?;
    log::info!(
        "Rendered {}x{} with '{}' in {:.2?}",
        config.width,
        config.height,
        entry_point,
        start.elapsed()
    );
    Ok(bitmap)
}

/// Run the configured kernel and convert the result to 8-bit RGB.
pub fn render(config: &RenderConfig) -> Result<Bitmap, RunError> {
    let raw = render_raw(config)?;
    Ok(raw.convert(PixelFormat::Rgb, ComponentType::UInt8, config.srgb_gamma))
}

/// Read a resource back and hand it to a display sink.
pub fn show_resource(
    device: &Device,
    resource: ResourceId,
    label: &str,
    sink: &mut dyn DisplaySink,
) -> Result<(), RunError> {
    let bitmap = device.to_bitmap(resource)?;
    sink.show(label, &bitmap)?;
    Ok(())
}
