//! Device-side print capture.
//!
//! Kernels that `#include "hostlog.wgsl"` append fixed-size records to a
//! storage buffer bound at [`super::PRINT_GROUP`]. The host drains the
//! buffer on [`super::Device::flush_log`].

use std::fmt;

use super::PRINT_GROUP;

pub(crate) const HOSTLOG_SHADER: &str = include_str!("shaders/hostlog.wgsl");

/// Header words before the records: count, capacity.
const HEADER_WORDS: u32 = 2;
const RECORD_WORDS: u32 = 4;

/// How the three values of a record are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintKind {
    U32,
    I32,
    F32,
}

impl PrintKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PrintKind::U32),
            1 => Some(PrintKind::I32),
            2 => Some(PrintKind::F32),
            _ => None,
        }
    }
}

/// One captured `print_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintRecord {
    pub kind: PrintKind,
    pub tag: u32,
    pub values: [u32; 3],
}

impl fmt::Display for PrintRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.values;
        match self.kind {
            PrintKind::U32 => write!(f, "[{}] {a} {b} {c}", self.tag),
            PrintKind::I32 => write!(f, "[{}] {} {} {}", self.tag, a as i32, b as i32, c as i32),
            PrintKind::F32 => write!(
                f,
                "[{}] {} {} {}",
                self.tag,
                f32::from_bits(a),
                f32::from_bits(b),
                f32::from_bits(c)
            ),
        }
    }
}

pub(crate) struct HostLog {
    capacity: u32,
    buffer: wgpu::Buffer,
    layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
}

impl HostLog {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Host Log Buffer"),
            size: Self::size_for(capacity),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&buffer, 0, bytemuck::cast_slice(&[0u32, capacity]));

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Host Log Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Host Log Bind Group"),
            layout: &layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        log::debug!("Print capture enabled at @group({PRINT_GROUP}), {capacity} records");
        Self {
            capacity,
            buffer,
            layout,
            bind_group,
        }
    }

    fn size_for(capacity: u32) -> u64 {
        (HEADER_WORDS as u64 + capacity as u64 * RECORD_WORDS as u64) * 4
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn size_bytes(&self) -> u64 {
        Self::size_for(self.capacity)
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    /// Decode buffer contents into records and the number dropped on overflow.
    pub fn decode(&self, words: &[u32]) -> (Vec<PrintRecord>, u32) {
        decode_records(words, self.capacity)
    }

    /// Zero the record counter. Takes effect before the next submission.
    pub fn reset(&self, queue: &wgpu::Queue) {
        queue.write_buffer(&self.buffer, 0, bytemuck::bytes_of(&0u32));
    }
}

fn decode_records(words: &[u32], capacity: u32) -> (Vec<PrintRecord>, u32) {
    let Some(&count) = words.first() else {
        return (Vec::new(), 0);
    };
    let stored = count.min(capacity) as usize;
    let records = words
        .get(HEADER_WORDS as usize..)
        .unwrap_or_default()
        .chunks_exact(RECORD_WORDS as usize)
        .take(stored)
        .filter_map(|chunk| {
            let kind = PrintKind::from_u32(chunk[0] >> 24)?;
            Some(PrintRecord {
                kind,
                tag: chunk[0] & 0x00ff_ffff,
                values: [chunk[1], chunk[2], chunk[3]],
            })
        })
        .collect();
    (records, count.saturating_sub(capacity))
}
