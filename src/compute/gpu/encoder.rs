//! Command recording.
//!
//! `CommandEncoder` (recording) → `finish()` → `CommandBuffer` (immutable)
//! → `Device::submit` → `SubmissionHandle` → `Device::wait` (completed).

use wgpu::util::DeviceExt;

use super::device::{Device, ResourceUsage};
use super::kernel::{Kernel, ResolvedField};
use super::{GpuError, KernelId};
use crate::schema::{Binding, BindingError, Bindings, FieldType};

/// Records dispatches for one command buffer. Consumed by [`Self::finish`].
pub struct CommandEncoder<'d> {
    device: &'d Device,
    encoder: wgpu::CommandEncoder,
    dispatches: usize,
}

impl<'d> CommandEncoder<'d> {
    pub(crate) fn new(device: &'d Device) -> Self {
        let encoder = device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Dispatch Encoder"),
            });
        Self {
            device,
            encoder,
            dispatches: 0,
        }
    }

    /// Record one dispatch of `kernel` over `thread_count` threads.
    ///
    /// All validation happens before anything is recorded: a failed
    /// dispatch leaves the encoder exactly as it was.
    pub fn dispatch(
        &mut self,
        kernel_id: KernelId,
        thread_count: [u32; 3],
        bindings: &Bindings,
    ) -> Result<(), GpuError> {
        let device = self.device;
        let kernel = device.kernel(kernel_id)?;

        if thread_count.contains(&0) {
            return Err(GpuError::InvalidThreadCount(thread_count));
        }
        kernel.schema.validate(bindings)?;

        let groups = kernel.workgroup_count(thread_count);
        let limit = device.limits().max_compute_workgroups_per_dimension;
        if let Some(axis) = groups.iter().position(|&g| g > limit) {
            return Err(GpuError::WorkgroupLimit {
                axis,
                groups: groups[axis],
                limit,
            });
        }

        let bind_groups = (0..kernel.layouts.len())
            .map(|block| create_block_bind_group(device, kernel, block, bindings))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "Dispatching {}::{} threads={:?} groups={:?}",
            kernel_id,
            kernel.entry_point,
            thread_count,
            groups
        );

        let mut pass = self
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.entry_point),
                timestamp_writes: None,
            });
        pass.set_pipeline(&kernel.pipeline);
        for (group, bind_group) in bind_groups.iter().enumerate() {
            pass.set_bind_group(group as u32, bind_group, &[]);
        }
        for (group, bind_group) in &kernel.filler_groups {
            pass.set_bind_group(*group, bind_group, &[]);
        }
        if kernel.uses_print()
            && let Some(hostlog) = &device.hostlog
        {
            pass.set_bind_group(super::PRINT_GROUP, hostlog.bind_group(), &[]);
        }
        pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        drop(pass);

        self.dispatches += 1;
        Ok(())
    }

    /// Number of dispatches recorded so far.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    pub fn finish(self) -> CommandBuffer {
        CommandBuffer {
            inner: self.encoder.finish(),
            dispatches: self.dispatches,
        }
    }
}

enum BoundResource {
    Buffer(wgpu::Buffer),
    View(wgpu::TextureView),
}

fn create_block_bind_group(
    device: &Device,
    kernel: &Kernel,
    block_index: usize,
    bindings: &Bindings,
) -> Result<wgpu::BindGroup, GpuError> {
    let block = &kernel.schema.blocks()[block_index];
    let fields = &kernel.interface.blocks[block_index];

    let mut bound = Vec::with_capacity(fields.len());
    for field in fields {
        let binding = bindings.get(block.name(), &field.name).ok_or_else(|| {
            BindingError::MissingField {
                block: block.name().to_string(),
                field: field.name.clone(),
            }
        })?;
        bound.push(bind_field(device, block.name(), field, binding)?);
    }

    let entries: Vec<wgpu::BindGroupEntry> = fields
        .iter()
        .zip(&bound)
        .map(|(field, resource)| wgpu::BindGroupEntry {
            binding: field.binding,
            resource: match resource {
                BoundResource::Buffer(buffer) => buffer.as_entire_binding(),
                BoundResource::View(view) => wgpu::BindingResource::TextureView(view),
            },
        })
        .collect();

    Ok(device.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(block.name()),
        layout: &kernel.layouts[block_index],
        entries: &entries,
    }))
}

fn bind_field(
    device: &Device,
    block: &str,
    field: &ResolvedField,
    binding: &Binding,
) -> Result<BoundResource, GpuError> {
    match (field.ty, binding) {
        (FieldType::Uniform(_), Binding::Value(value)) => {
            let buffer = device
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(&field.name),
                    contents: &value.to_uniform_bytes(),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            Ok(BoundResource::Buffer(buffer))
        }
        (ty, Binding::Resource(id)) => {
            let resource = device.resource(*id)?;
            let (reads, writes) = match ty {
                FieldType::StorageTexture(access) => (access.reads(), access.writes()),
                FieldType::SampledTexture => (true, false),
                FieldType::Uniform(_) => (false, false),
            };
            let usage = resource.desc.usage;
            if reads && !usage.contains(ResourceUsage::SHADER_READ) {
                return Err(BindingError::MissingUsage {
                    block: block.to_string(),
                    field: field.name.clone(),
                    required: "shader-readable",
                }
                .into());
            }
            if writes && !usage.contains(ResourceUsage::SHADER_WRITE) {
                return Err(BindingError::MissingUsage {
                    block: block.to_string(),
                    field: field.name.clone(),
                    required: "shader-writable",
                }
                .into());
            }
            if let Some(expected) = field.format
                && expected != resource.desc.format
            {
                return Err(BindingError::FormatMismatch {
                    block: block.to_string(),
                    field: field.name.clone(),
                    expected: format!("{expected:?}"),
                    found: format!("{:?}", resource.desc.format),
                }
                .into());
            }
            Ok(BoundResource::View(
                resource.texture.create_view(&wgpu::TextureViewDescriptor::default()),
            ))
        }
        // Bindings were validated against the schema before this point.
        (ty, Binding::Value(value)) => Err(BindingError::TypeMismatch {
            block: block.to_string(),
            field: field.name.clone(),
            expected: ty.to_string(),
            found: format!("uniform {}", value.value_type()),
        }
        .into()),
    }
}

/// A finished, immutable command buffer.
pub struct CommandBuffer {
    inner: wgpu::CommandBuffer,
    dispatches: usize,
}

impl CommandBuffer {
    pub fn dispatch_count(&self) -> usize {
        self.dispatches
    }

    pub(crate) fn into_inner(self) -> wgpu::CommandBuffer {
        self.inner
    }
}

/// Completion handle returned by [`Device::submit`].
#[derive(Debug, Clone)]
pub struct SubmissionHandle {
    index: wgpu::SubmissionIndex,
    serial: u64,
}

impl SubmissionHandle {
    pub(crate) fn new(index: wgpu::SubmissionIndex, serial: u64) -> Self {
        Self { index, serial }
    }

    pub(crate) fn index(&self) -> &wgpu::SubmissionIndex {
        &self.index
    }

    /// 1-based position of this submission on the device queue.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::gpu::test_support::try_device;
    use crate::compute::gpu::{DeviceOptions, ResourceDesc, ResourceFormat, ResourceId, Stage};
    use crate::schema::{Access, KernelSchema, ParameterBlock, Value, ValueType};

    /// Writes `Origin.x + 1` into every texel it covers, offset by `Origin`.
    const HALVES_SHADER: &str = "\
@group(0) @binding(0) var<uniform> Origin: vec2<u32>;
@group(0) @binding(1) var<uniform> Extent: vec2<u32>;
@group(0) @binding(2) var OutTexture: texture_storage_2d<rgba32float, write>;

@compute @workgroup_size(4, 4, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= Extent.x || id.y >= Extent.y) {
        return;
    }
    let p = id.xy + Origin;
    textureStore(OutTexture, vec2<i32>(p), vec4<f32>(f32(Origin.x) + 1.0, f32(p.x), f32(p.y), 1.0));
}
";

    fn schema() -> KernelSchema {
        KernelSchema::new().block(
            ParameterBlock::new("Params")
                .field("Origin", FieldType::Uniform(ValueType::UInt2))
                .field("Extent", FieldType::Uniform(ValueType::UInt2))
                .field("OutTexture", FieldType::StorageTexture(Access::Write)),
        )
    }

    fn bindings(origin: [u32; 2], extent: [u32; 2], out: ResourceId) -> Bindings {
        Bindings::new()
            .set("Params", "Origin", Value::UInt2(origin))
            .set("Params", "Extent", Value::UInt2(extent))
            .set("Params", "OutTexture", out)
    }

    fn setup(width: u32, height: u32) -> Option<(Device, KernelId, ResourceId)> {
        let mut device = try_device(DeviceOptions::default())?;
        let desc = ResourceDesc::new(
            ResourceFormat::Rgba32Float,
            width,
            height,
            ResourceUsage::SHADER_READ | ResourceUsage::SHADER_WRITE,
        )
        .with_label("halves");
        let out = device.create_resource_filled(&desc, 1.0).unwrap();
        let program = device
            .load_program_from_source("halves.wgsl", HALVES_SHADER, &["main"])
            .unwrap();
        let kernel = device.create_kernel(program, "main", schema()).unwrap();
        Some((device, kernel, out))
    }

    #[test]
    fn test_missing_field_performs_no_work() {
        let Some((mut device, kernel, out)) = setup(4, 4) else {
            return;
        };

        let mut incomplete = bindings([0, 0], [4, 4], out);
        incomplete.remove("Params", "Extent");

        let mut encoder = device.create_command_encoder();
        let result = encoder.dispatch(kernel, [4, 4, 1], &incomplete);
        assert!(matches!(
            result,
            Err(GpuError::BindingMismatch(BindingError::MissingField { .. }))
        ));
        assert_eq!(encoder.dispatch_count(), 0);

        let commands = encoder.finish();
        assert_eq!(commands.dispatch_count(), 0);
        let handle = device.submit(commands);
        device.wait(Some(&handle)).unwrap();

        let bitmap = device.to_bitmap(out).unwrap();
        assert!(bitmap.as_f32().unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_zero_thread_count_rejected() {
        let Some((device, kernel, out)) = setup(4, 4) else {
            return;
        };
        let mut encoder = device.create_command_encoder();
        assert!(matches!(
            encoder.dispatch(kernel, [4, 0, 1], &bindings([0, 0], [4, 4], out)),
            Err(GpuError::InvalidThreadCount([4, 0, 1]))
        ));
    }

    #[test]
    fn test_resource_usage_checked() {
        let Some((mut device, kernel, _)) = setup(4, 4) else {
            return;
        };
        let read_only = ResourceDesc::new(ResourceFormat::Rgba32Float, 4, 4, ResourceUsage::SHADER_READ);
        let target = device.create_resource_filled(&read_only, 0.0).unwrap();

        let mut encoder = device.create_command_encoder();
        assert!(matches!(
            encoder.dispatch(kernel, [4, 4, 1], &bindings([0, 0], [4, 4], target)),
            Err(GpuError::BindingMismatch(BindingError::MissingUsage { .. }))
        ));
    }

    #[test]
    fn test_resource_format_checked() {
        let Some((mut device, kernel, _)) = setup(4, 4) else {
            return;
        };
        let single = ResourceDesc::new(
            ResourceFormat::R32Float,
            4,
            4,
            ResourceUsage::SHADER_READ | ResourceUsage::SHADER_WRITE,
        );
        let target = device.create_resource_filled(&single, 0.0).unwrap();

        let mut encoder = device.create_command_encoder();
        assert!(matches!(
            encoder.dispatch(kernel, [4, 4, 1], &bindings([0, 0], [4, 4], target)),
            Err(GpuError::BindingMismatch(BindingError::FormatMismatch { .. }))
        ));
    }

    #[test]
    fn test_two_submissions_write_disjoint_halves() {
        let (width, height) = (8u32, 3u32);
        let Some((mut device, kernel, out)) = setup(width, height) else {
            return;
        };
        let half = width / 2;

        let mut left = device.create_command_encoder();
        left.dispatch(kernel, [half, height, 1], &bindings([0, 0], [half, height], out))
            .unwrap();
        let left = left.finish();

        let mut right = device.create_command_encoder();
        right
            .dispatch(kernel, [half, height, 1], &bindings([half, 0], [half, height], out))
            .unwrap();
        let right = right.finish();

        let first = device.submit(left);
        let second = device.submit(right);
        assert!(second.serial() > first.serial());
        device.wait(None).unwrap();

        let bitmap = device.to_bitmap(out).unwrap();
        let texels = bitmap.as_f32().unwrap();
        for y in 0..height {
            for x in 0..width {
                let i = ((y * width + x) * 4) as usize;
                let expected_tag = if x < half { 1.0 } else { half as f32 + 1.0 };
                assert_eq!(
                    &texels[i..i + 4],
                    &[expected_tag, x as f32, y as f32, 1.0],
                    "texel ({x}, {y})"
                );
            }
        }
    }

    #[test]
    fn test_workgroups_cover_partial_groups() {
        let Some((mut device, kernel, out)) = setup(5, 5) else {
            return;
        };
        assert_eq!(device.kernel(kernel).unwrap().workgroup_count([5, 5, 1]), [2, 2, 1]);

        let mut encoder = device.create_command_encoder();
        encoder
            .dispatch(kernel, [5, 5, 1], &bindings([0, 0], [5, 5], out))
            .unwrap();
        let handle = device.submit(encoder.finish());
        device.wait(Some(&handle)).unwrap();

        let bitmap = device.to_bitmap(out).unwrap();
        let texels = bitmap.as_f32().unwrap();
        let last = texels.len() - 4;
        assert_eq!(&texels[last..], &[1.0, 4.0, 4.0, 1.0]);
    }

    #[test]
    fn test_usage_conflict_surfaces_at_wait() {
        const COPY_SHADER: &str = "\
@group(0) @binding(0) var OutTexture: texture_storage_2d<rgba32float, write>;
@group(1) @binding(0) var Source: texture_2d<f32>;

@compute @workgroup_size(4, 4, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(OutTexture, vec2<i32>(id.xy), textureLoad(Source, vec2<i32>(id.xy), 0));
}
";
        let Some(mut device) = try_device(DeviceOptions::default()) else {
            return;
        };
        let desc = ResourceDesc::new(
            ResourceFormat::Rgba32Float,
            4,
            4,
            ResourceUsage::SHADER_READ | ResourceUsage::SHADER_WRITE,
        );
        let texture = device.create_resource_filled(&desc, 0.5).unwrap();
        let program = device
            .load_program_from_source("copy.wgsl", COPY_SHADER, &["main"])
            .unwrap();
        let schema = KernelSchema::new()
            .block(ParameterBlock::new("Params").field("OutTexture", FieldType::StorageTexture(Access::Write)))
            .block(ParameterBlock::new("Input").field("Source", FieldType::SampledTexture));
        let kernel = device.create_kernel(program, "main", schema).unwrap();

        // Host-side checks pass; the backend rejects the aliased usages.
        let aliased = Bindings::new()
            .set("Params", "OutTexture", texture)
            .set("Input", "Source", texture);
        let mut encoder = device.create_command_encoder();
        encoder.dispatch(kernel, [4, 4, 1], &aliased).unwrap();
        let commands = encoder.finish();
        let handle = device.submit(commands);

        let err = device.wait(Some(&handle)).unwrap_err();
        assert!(matches!(err, GpuError::Execution(_)), "unexpected {err:?}");
        assert_eq!(err.stage(), Stage::Execution);

        // The fault is reported once.
        device.wait(None).unwrap();
    }
}
