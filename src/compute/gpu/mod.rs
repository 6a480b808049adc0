//! GPU compute backend.
//!
//! A single [`Device`] owns every resource, program and kernel created
//! through it; callers refer to them with copyable handles. Work flows
//! through [`CommandEncoder`] → [`CommandBuffer`] → [`Device::submit`] →
//! [`Device::wait`], after which results may be read back.

mod device;
mod encoder;
mod hostlog;
mod kernel;
mod program;

use std::fmt;

pub use device::{Device, DeviceOptions, ResourceDesc, ResourceFormat, ResourceUsage};
pub use encoder::{CommandBuffer, CommandEncoder, SubmissionHandle};
pub use hostlog::{PrintKind, PrintRecord};
pub use kernel::Kernel;
pub use program::{CompileError, Program};

use crate::schema::BindingError;

/// Bind group reserved for the device print buffer.
pub const PRINT_GROUP: u32 = 3;

/// Name of the virtual include providing `print_*` helpers.
pub const HOSTLOG_INCLUDE: &str = "hostlog.wgsl";

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            device: u32,
            index: u32,
        }

        impl $name {
            pub(crate) fn new(device: u32, index: u32) -> Self {
                Self { device, index }
            }

            pub(crate) fn device(self) -> u32 {
                self.device
            }

            pub(crate) fn index(self) -> usize {
                self.index as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}.{}"), self.device, self.index)
            }
        }
    };
}

handle!(
    /// Handle to a device-owned image resource.
    ResourceId,
    "resource"
);
handle!(
    /// Handle to a compiled program.
    ProgramId,
    "program"
);
handle!(
    /// Handle to a kernel bound to one program entry point.
    KernelId,
    "kernel"
);

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Config,
    DeviceInit,
    Compile,
    Resource,
    Dispatch,
    Execution,
    Readback,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Config => "configuration",
            Stage::DeviceInit => "device init",
            Stage::Compile => "compile",
            Stage::Resource => "resource creation",
            Stage::Dispatch => "dispatch",
            Stage::Execution => "execution",
            Stage::Readback => "readback",
            Stage::Export => "export",
        };
        f.write_str(name)
    }
}

/// Error type for GPU operations.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,

    #[error("Selected adapter does not support compute shaders")]
    ComputeUnsupported,

    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    #[error("Binding mismatch: {0}")]
    BindingMismatch(#[from] BindingError),

    #[error("Thread count {0:?} must be at least 1 in every dimension")]
    InvalidThreadCount([u32; 3]),

    #[error("Dispatch needs {groups} workgroups along axis {axis}, device limit is {limit}")]
    WorkgroupLimit { axis: usize, groups: u32, limit: u32 },

    #[error("{0} does not belong to this device")]
    InvalidHandle(String),

    #[error("Resource `{0}` is not shader-readable and cannot be read back")]
    NotReadable(String),

    #[error("Device execution failed: {0}")]
    Execution(String),

    #[error("Buffer mapping failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),
}

impl GpuError {
    pub fn stage(&self) -> Stage {
        match self {
            GpuError::NoAdapter | GpuError::ComputeUnsupported | GpuError::DeviceRequest(_) => {
                Stage::DeviceInit
            }
            GpuError::Compile(_) => Stage::Compile,
            GpuError::ResourceCreation(_) => Stage::Resource,
            GpuError::BindingMismatch(_)
            | GpuError::InvalidThreadCount(_)
            | GpuError::WorkgroupLimit { .. }
            | GpuError::InvalidHandle(_) => Stage::Dispatch,
            GpuError::Execution(_) => Stage::Execution,
            GpuError::NotReadable(_) | GpuError::BufferMap(_) => Stage::Readback,
        }
    }

    /// True when no usable device exists; GPU tests skip on this.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            GpuError::NoAdapter | GpuError::ComputeUnsupported | GpuError::DeviceRequest(_)
        )
    }
}
