//! Device - owns the GPU context and everything created through it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::encoder::{CommandBuffer, CommandEncoder, SubmissionHandle};
use super::hostlog::{HOSTLOG_SHADER, HostLog};
use super::kernel::{self, Kernel};
use super::program::{Program, SourceResolver};
use super::{GpuError, HOSTLOG_INCLUDE, KernelId, ProgramId, ResourceId};
use crate::image::{Bitmap, BitmapData, ComponentType, PixelFormat};
use crate::schema::KernelSchema;

static NEXT_DEVICE_SERIAL: AtomicU32 = AtomicU32::new(0);

/// Options for [`Device::new`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Enable backend validation and debug layers.
    pub enable_debug_layers: bool,
    /// Make `hostlog.wgsl` available and capture its records.
    pub enable_print: bool,
    /// Directories searched for shader sources and includes.
    pub include_paths: Vec<PathBuf>,
    /// Maximum number of print records kept between flushes.
    pub print_capacity: u32,
    /// Adapter preference passed to `request_adapter`.
    pub power_preference: wgpu::PowerPreference,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            enable_debug_layers: false,
            enable_print: false,
            include_paths: Vec::new(),
            print_capacity: 4096,
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }
}

/// Element format of a resource. All formats are 32-bit float per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceFormat {
    R32Float,
    Rg32Float,
    Rgba32Float,
}

impl ResourceFormat {
    pub fn channels(self) -> u32 {
        match self {
            ResourceFormat::R32Float => 1,
            ResourceFormat::Rg32Float => 2,
            ResourceFormat::Rgba32Float => 4,
        }
    }

    pub fn bytes_per_texel(self) -> u32 {
        self.channels() * 4
    }

    pub(crate) fn texture_format(self) -> wgpu::TextureFormat {
        match self {
            ResourceFormat::R32Float => wgpu::TextureFormat::R32Float,
            ResourceFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
            ResourceFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }

    pub(crate) fn from_storage_format(format: naga::StorageFormat) -> Option<Self> {
        match format {
            naga::StorageFormat::R32Float => Some(ResourceFormat::R32Float),
            naga::StorageFormat::Rg32Float => Some(ResourceFormat::Rg32Float),
            naga::StorageFormat::Rgba32Float => Some(ResourceFormat::Rgba32Float),
            _ => None,
        }
    }

    pub(crate) fn pixel_format(self) -> PixelFormat {
        match self {
            ResourceFormat::R32Float => PixelFormat::R,
            ResourceFormat::Rg32Float => PixelFormat::Rg,
            ResourceFormat::Rgba32Float => PixelFormat::Rgba,
        }
    }
}

bitflags::bitflags! {
    /// How shaders may access a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceUsage: u32 {
        /// Bindable as a sampled or read-only storage texture; required for readback.
        const SHADER_READ = 1 << 0;
        /// Bindable as a writable storage texture.
        const SHADER_WRITE = 1 << 1;
    }
}

impl ResourceUsage {
    pub(crate) fn texture_usages(self) -> wgpu::TextureUsages {
        let mut usages = wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        if self.contains(ResourceUsage::SHADER_READ) {
            usages |= wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::STORAGE_BINDING;
        }
        if self.contains(ResourceUsage::SHADER_WRITE) {
            usages |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        usages
    }
}

/// Immutable description of a 2D resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub format: ResourceFormat,
    pub width: u32,
    pub height: u32,
    pub usage: ResourceUsage,
    pub label: Option<String>,
}

impl ResourceDesc {
    pub fn new(format: ResourceFormat, width: u32, height: u32, usage: ResourceUsage) -> Self {
        Self {
            format,
            width,
            height,
            usage,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Number of `f32` elements in the initial payload.
    pub fn element_count(&self) -> usize {
        self.width as usize * self.height as usize * self.format.channels() as usize
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or("<unnamed>")
    }

    /// Check dimensions, usage and payload size before touching the device.
    pub fn validate(&self, data_len: usize, max_dimension: u32) -> Result<(), GpuError> {
        if self.width == 0 || self.height == 0 {
            return Err(GpuError::ResourceCreation(format!(
                "`{}` has zero dimension {}x{}",
                self.display_name(),
                self.width,
                self.height
            )));
        }
        if self.width > max_dimension || self.height > max_dimension {
            return Err(GpuError::ResourceCreation(format!(
                "`{}` is {}x{}, device limit is {max_dimension}",
                self.display_name(),
                self.width,
                self.height
            )));
        }
        if self.usage.is_empty() {
            return Err(GpuError::ResourceCreation(format!(
                "`{}` has no usage flags",
                self.display_name()
            )));
        }
        if data_len != self.element_count() {
            return Err(GpuError::ResourceCreation(format!(
                "`{}` expects {} elements ({}x{}x{}), got {data_len}",
                self.display_name(),
                self.element_count(),
                self.width,
                self.height,
                self.format.channels()
            )));
        }
        Ok(())
    }
}

pub(crate) struct Resource {
    pub desc: ResourceDesc,
    pub texture: wgpu::Texture,
}

/// Collects uncaptured backend errors until the next wait.
#[derive(Clone, Default)]
struct ErrorSink(Arc<Mutex<Vec<String>>>);

impl ErrorSink {
    fn push(&self, message: String) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(message);
    }

    fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Logical GPU device. Owns all resources, programs and kernels.
pub struct Device {
    serial: u32,
    options: DeviceOptions,
    adapter_info: wgpu::AdapterInfo,
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    errors: ErrorSink,
    resolver: SourceResolver,
    resources: Vec<Resource>,
    programs: Vec<Program>,
    kernels: Vec<Kernel>,
    pub(crate) hostlog: Option<HostLog>,
    submissions: u64,
}

impl Device {
    /// Create a new device.
    pub async fn new(options: DeviceOptions) -> Result<Self, GpuError> {
        let flags = if options.enable_debug_layers {
            wgpu::InstanceFlags::debugging()
        } else {
            wgpu::InstanceFlags::empty()
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| GpuError::NoAdapter)?;

        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        {
            return Err(GpuError::ComputeUnsupported);
        }

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Kernel Runner Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await?;

        let errors = ErrorSink::default();
        let sink = errors.clone();
        device.on_uncaptured_error(Arc::new(move |error: wgpu::Error| {
            log::error!("GPU error: {error}");
            sink.push(error.to_string());
        }));

        let adapter_info = adapter.get_info();
        log::info!(
            "Using adapter {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.device_type
        );

        let mut resolver = SourceResolver::new(options.include_paths.clone());
        let hostlog = if options.enable_print {
            resolver.register_virtual(HOSTLOG_INCLUDE, HOSTLOG_SHADER);
            Some(HostLog::new(&device, &queue, options.print_capacity))
        } else {
            None
        };

        Ok(Self {
            serial: NEXT_DEVICE_SERIAL.fetch_add(1, Ordering::Relaxed),
            options,
            adapter_info,
            device,
            queue,
            errors,
            resolver,
            resources: Vec::new(),
            programs: Vec::new(),
            kernels: Vec::new(),
            hostlog,
            submissions: 0,
        })
    }

    /// Create a new device, blocking the current thread.
    pub fn new_blocking(options: DeviceOptions) -> Result<Self, GpuError> {
        pollster::block_on(Self::new(options))
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Allocate a 2D resource and upload its initial contents.
    pub fn create_resource(&mut self, desc: &ResourceDesc, data: &[f32]) -> Result<ResourceId, GpuError> {
        desc.validate(data.len(), self.device.limits().max_texture_dimension_2d)?;

        let size = wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format.texture_format(),
            usage: desc.usage.texture_usages(),
            view_formats: &[],
        });

        self.queue.write_texture(
            texture.as_image_copy(),
            bytemuck::cast_slice(data),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * desc.format.bytes_per_texel()),
                rows_per_image: Some(desc.height),
            },
            size,
        );

        let errors = self.errors.drain();
        if !errors.is_empty() {
            return Err(GpuError::ResourceCreation(errors.join("; ")));
        }

        log::debug!(
            "Created resource `{}` {}x{} {:?} {:?}",
            desc.display_name(),
            desc.width,
            desc.height,
            desc.format,
            desc.usage
        );
        let id = ResourceId::new(self.serial, self.resources.len() as u32);
        self.resources.push(Resource {
            desc: desc.clone(),
            texture,
        });
        Ok(id)
    }

    /// Allocate a resource with every element set to `value`.
    pub fn create_resource_filled(&mut self, desc: &ResourceDesc, value: f32) -> Result<ResourceId, GpuError> {
        let data = vec![value; desc.element_count()];
        self.create_resource(desc, &data)
    }

    /// Upload a host bitmap as a linear RGBA float resource.
    pub fn create_resource_from_bitmap(
        &mut self,
        bitmap: &Bitmap,
        usage: ResourceUsage,
        label: Option<&str>,
    ) -> Result<ResourceId, GpuError> {
        let linear = bitmap.convert(PixelFormat::Rgba, ComponentType::Float32, false);
        let data = linear
            .as_f32()
            .ok_or_else(|| GpuError::ResourceCreation("bitmap conversion produced non-float data".into()))?;
        let mut desc = ResourceDesc::new(ResourceFormat::Rgba32Float, bitmap.width(), bitmap.height(), usage);
        desc.label = label.map(str::to_string);
        self.create_resource(&desc, data)
    }

    pub fn resource_info(&self, id: ResourceId) -> Result<&ResourceDesc, GpuError> {
        Ok(&self.resource(id)?.desc)
    }

    /// Load and compile a WGSL file, verifying the named entry points.
    pub fn load_program(&mut self, path: impl AsRef<Path>, entry_points: &[&str]) -> Result<ProgramId, GpuError> {
        let path = path.as_ref();
        log::info!("Loading shader program from '{}'", path.display());
        let compiled = self.resolver.compile_file(path, entry_points)?;
        Ok(self.add_program(path.display().to_string(), compiled))
    }

    /// Compile an in-memory WGSL source. `name` is used in diagnostics and
    /// as the base for relative includes.
    pub fn load_program_from_source(
        &mut self,
        name: &str,
        source: &str,
        entry_points: &[&str],
    ) -> Result<ProgramId, GpuError> {
        let compiled = self
            .resolver
            .compile_source(Path::new(name), source, entry_points)?;
        Ok(self.add_program(name.to_string(), compiled))
    }

    fn add_program(&mut self, name: String, compiled: super::program::CompiledSource) -> ProgramId {
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&name),
            source: wgpu::ShaderSource::Wgsl(compiled.source.clone().into()),
        });
        let id = ProgramId::new(self.serial, self.programs.len() as u32);
        self.programs.push(Program {
            name,
            compiled,
            shader,
        });
        id
    }

    pub fn program(&self, id: ProgramId) -> Result<&Program, GpuError> {
        self.check_serial(id.device(), id)?;
        self.programs
            .get(id.index())
            .ok_or_else(|| GpuError::InvalidHandle(id.to_string()))
    }

    /// Bind one program entry point to a parameter schema.
    pub fn create_kernel(
        &mut self,
        program: ProgramId,
        entry_point: &str,
        schema: KernelSchema,
    ) -> Result<KernelId, GpuError> {
        let kernel = kernel::build(
            &self.device,
            program,
            self.program(program)?,
            entry_point,
            schema,
            self.hostlog.as_ref(),
        )?;

        let errors = self.errors.drain();
        if !errors.is_empty() {
            return Err(super::CompileError::new(self.program(program)?.name(), errors.join("; ")).into());
        }

        let id = KernelId::new(self.serial, self.kernels.len() as u32);
        self.kernels.push(kernel);
        Ok(id)
    }

    pub fn kernel(&self, id: KernelId) -> Result<&Kernel, GpuError> {
        self.check_serial(id.device(), id)?;
        self.kernels
            .get(id.index())
            .ok_or_else(|| GpuError::InvalidHandle(id.to_string()))
    }

    pub(crate) fn resource(&self, id: ResourceId) -> Result<&Resource, GpuError> {
        self.check_serial(id.device(), id)?;
        self.resources
            .get(id.index())
            .ok_or_else(|| GpuError::InvalidHandle(id.to_string()))
    }

    fn check_serial(&self, serial: u32, handle: impl std::fmt::Display) -> Result<(), GpuError> {
        if serial != self.serial {
            return Err(GpuError::InvalidHandle(handle.to_string()));
        }
        Ok(())
    }

    pub fn create_command_encoder(&self) -> CommandEncoder<'_> {
        CommandEncoder::new(self)
    }

    /// Queue a finished command buffer. Does not block.
    pub fn submit(&mut self, commands: CommandBuffer) -> SubmissionHandle {
        self.submissions += 1;
        let dispatches = commands.dispatch_count();
        let index = self.queue.submit([commands.into_inner()]);
        log::debug!(
            "Submitted command buffer #{} ({} dispatches)",
            self.submissions,
            dispatches
        );
        SubmissionHandle::new(index, self.submissions)
    }

    /// Block until `handle` (or, with `None`, everything submitted so far)
    /// has completed. Backend faults raised meanwhile surface here.
    pub fn wait(&self, handle: Option<&SubmissionHandle>) -> Result<(), GpuError> {
        self.poll_wait(handle.map(|h| h.index().clone()))?;
        if let Some(handle) = handle {
            log::debug!("Submission #{} completed", handle.serial());
        }
        Ok(())
    }

    fn poll_wait(&self, submission_index: Option<wgpu::SubmissionIndex>) -> Result<(), GpuError> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index,
                timeout: None,
            })
            .map_err(|e| GpuError::Execution(e.to_string()))?;
        let errors = self.errors.drain();
        if !errors.is_empty() {
            return Err(GpuError::Execution(errors.join("; ")));
        }
        Ok(())
    }

    /// Drain captured device print records to the host log.
    ///
    /// Returns the formatted lines. Records written by a dispatch are only
    /// guaranteed to be present after a [`Device::wait`] for it.
    pub fn flush_log(&self) -> Result<Vec<String>, GpuError> {
        let Some(hostlog) = &self.hostlog else {
            return Ok(Vec::new());
        };
        let bytes = self.read_buffer(hostlog.buffer(), hostlog.size_bytes())?;
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        let (records, dropped) = hostlog.decode(&words);
        hostlog.reset(&self.queue);

        let lines: Vec<String> = records.iter().map(|r| r.to_string()).collect();
        for line in &lines {
            log::info!(target: "device_print", "{line}");
        }
        if dropped > 0 {
            log::warn!(target: "device_print", "{dropped} print records dropped (capacity {})", hostlog.capacity());
        }
        Ok(lines)
    }

    /// Copy a resource to host memory. Blocks until the copy completes.
    pub fn to_bitmap(&self, id: ResourceId) -> Result<Bitmap, GpuError> {
        let resource = self.resource(id)?;
        let desc = &resource.desc;
        if !desc.usage.contains(ResourceUsage::SHADER_READ) {
            return Err(GpuError::NotReadable(desc.display_name().to_string()));
        }

        let unpadded = desc.width * desc.format.bytes_per_texel();
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging Buffer"),
            size: padded as u64 * desc.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            resource.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(desc.height),
                },
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        let index = self.queue.submit([encoder.finish()]);
        let bytes = self.map_read(&staging, index)?;

        let mut texels = Vec::with_capacity(desc.element_count());
        for row in bytes.chunks_exact(padded as usize) {
            texels.extend(
                row[..unpadded as usize]
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
        }

        Bitmap::from_parts(
            desc.width,
            desc.height,
            desc.format.pixel_format(),
            false,
            BitmapData::Float32(texels),
        )
        .map_err(|e| GpuError::Execution(format!("readback produced malformed data: {e}")))
    }

    /// Copy the first `size` bytes of a buffer back to the host.
    pub(crate) fn read_buffer(&self, source: &wgpu::Buffer, size: u64) -> Result<Vec<u8>, GpuError> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Buffer Readback Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Buffer Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        let index = self.queue.submit([encoder.finish()]);
        self.map_read(&staging, index)
    }

    /// Synchronous buffer map for native targets.
    fn map_read(&self, staging: &wgpu::Buffer, index: wgpu::SubmissionIndex) -> Result<Vec<u8>, GpuError> {
        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.poll_wait(Some(index))?;
        rx.recv()
            .map_err(|_| GpuError::Execution("buffer map callback was dropped".into()))??;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }
}
