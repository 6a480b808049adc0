//! Kernel - one compute entry point bound to a parameter schema.
//!
//! At creation the schema is checked against the reflected shader
//! interface, so a dispatch only has to validate the supplied bindings.

use std::collections::HashMap;

use naga::{AddressSpace, ImageClass, ImageDimension, StorageAccess, TypeInner};

use super::device::ResourceFormat;
use super::hostlog::HostLog;
use super::program::{CompiledSource, Program};
use super::{GpuError, PRINT_GROUP, ProgramId};
use crate::schema::{Access, BindingError, FieldType, KernelSchema, ScalarKind, ValueType};

/// A schema field resolved against the shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedField {
    pub name: String,
    pub binding: u32,
    pub ty: FieldType,
    /// Storage texture format declared by the shader.
    pub format: Option<ResourceFormat>,
}

/// Reflected interface of one entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Interface {
    /// Per schema block, in schema order.
    pub blocks: Vec<Vec<ResolvedField>>,
    pub workgroup_size: [u32; 3],
    pub uses_print: bool,
}

/// Compiled compute pipeline plus everything needed to bind it.
pub struct Kernel {
    pub(crate) program: ProgramId,
    pub(crate) entry_point: String,
    pub(crate) schema: KernelSchema,
    pub(crate) interface: Interface,
    pub(crate) layouts: Vec<wgpu::BindGroupLayout>,
    /// Empty groups between the schema blocks and the print group.
    pub(crate) filler_groups: Vec<(u32, wgpu::BindGroup)>,
    pub(crate) pipeline: wgpu::ComputePipeline,
}

impl Kernel {
    pub fn program(&self) -> ProgramId {
        self.program
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn schema(&self) -> &KernelSchema {
        &self.schema
    }

    /// Threads per workgroup, from the entry point's `@workgroup_size`.
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.interface.workgroup_size
    }

    pub fn uses_print(&self) -> bool {
        self.interface.uses_print
    }

    /// Workgroups needed to cover `thread_count` (ceil-division per axis).
    pub fn workgroup_count(&self, thread_count: [u32; 3]) -> [u32; 3] {
        workgroup_count(thread_count, self.interface.workgroup_size)
    }
}

pub(crate) fn workgroup_count(thread_count: [u32; 3], workgroup_size: [u32; 3]) -> [u32; 3] {
    std::array::from_fn(|axis| thread_count[axis].div_ceil(workgroup_size[axis].max(1)))
}

pub(crate) fn build(
    device: &wgpu::Device,
    program_id: ProgramId,
    program: &Program,
    entry_point: &str,
    schema: KernelSchema,
    hostlog: Option<&HostLog>,
) -> Result<Kernel, GpuError> {
    let print_group = hostlog.map(|_| PRINT_GROUP);
    let interface = reflect(&program.compiled, entry_point, &schema, print_group)
        .map_err(|e| match e {
            ReflectError::Compile(message) => {
                GpuError::Compile(super::CompileError::new(program.name(), message))
            }
            ReflectError::Binding(e) => GpuError::BindingMismatch(e),
        })?;

    let layouts: Vec<wgpu::BindGroupLayout> = schema
        .blocks()
        .iter()
        .zip(&interface.blocks)
        .map(|(block, fields)| {
            let entries: Vec<wgpu::BindGroupLayoutEntry> = fields.iter().map(layout_entry).collect();
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(block.name()),
                entries: &entries,
            })
        })
        .collect();

    let mut filler_layouts = Vec::new();
    let mut filler_groups = Vec::new();
    if interface.uses_print {
        for group in layouts.len() as u32..PRINT_GROUP {
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Empty Bind Group Layout"),
                entries: &[],
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Empty Bind Group"),
                layout: &layout,
                entries: &[],
            });
            filler_layouts.push(layout);
            filler_groups.push((group, bind_group));
        }
    }

    let mut layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().chain(&filler_layouts).collect();
    if let (true, Some(hostlog)) = (interface.uses_print, hostlog) {
        layout_refs.push(hostlog.layout());
    }

    let label = format!("{}::{}", program.name(), entry_point);
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&label),
        bind_group_layouts: &layout_refs,
        ..Default::default()
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&label),
        layout: Some(&pipeline_layout),
        module: &program.shader,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    });

    log::debug!(
        "Created kernel {label} with workgroup size {:?}",
        interface.workgroup_size
    );

    Ok(Kernel {
        program: program_id,
        entry_point: entry_point.to_string(),
        schema,
        interface,
        layouts,
        filler_groups,
        pipeline,
    })
}

fn layout_entry(field: &ResolvedField) -> wgpu::BindGroupLayoutEntry {
    let ty = match field.ty {
        FieldType::Uniform(_) => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        FieldType::StorageTexture(access) => wgpu::BindingType::StorageTexture {
            access: match access {
                Access::Read => wgpu::StorageTextureAccess::ReadOnly,
                Access::Write => wgpu::StorageTextureAccess::WriteOnly,
                Access::ReadWrite => wgpu::StorageTextureAccess::ReadWrite,
            },
            format: field
                .format
                .unwrap_or(ResourceFormat::Rgba32Float)
                .texture_format(),
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        FieldType::SampledTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding: field.binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    }
}

#[derive(Debug)]
pub(crate) enum ReflectError {
    Compile(String),
    Binding(BindingError),
}

impl From<BindingError> for ReflectError {
    fn from(e: BindingError) -> Self {
        ReflectError::Binding(e)
    }
}

/// Check `schema` against the shader interface of `entry_point`.
pub(crate) fn reflect(
    compiled: &CompiledSource,
    entry_point: &str,
    schema: &KernelSchema,
    print_group: Option<u32>,
) -> Result<Interface, ReflectError> {
    let module = &compiled.module;
    let ep_index = compiled
        .entry_point_index(entry_point)
        .ok_or_else(|| ReflectError::Compile(format!("compute entry point `{entry_point}` not found")))?;
    let entry = &module.entry_points[ep_index];

    let max_blocks = print_group.unwrap_or(PRINT_GROUP + 1) as usize;
    if schema.blocks().len() > max_blocks {
        return Err(BindingError::TooManyBlocks {
            count: schema.blocks().len(),
            max: max_blocks,
        }
        .into());
    }
    if let Some(name) = schema.duplicate_block() {
        return Err(BindingError::DuplicateBlock(name.to_string()).into());
    }

    // (group, name) -> (binding, global)
    let mut globals = HashMap::new();
    for (_, var) in module.global_variables.iter() {
        if let (Some(binding), Some(name)) = (&var.binding, &var.name) {
            globals.insert((binding.group, name.as_str()), (binding.binding, var));
        }
    }

    let mut blocks = Vec::with_capacity(schema.blocks().len());
    for (group, block) in schema.blocks().iter().enumerate() {
        let group = group as u32;
        let mut fields = Vec::with_capacity(block.fields().len());
        for field in block.fields() {
            let Some(&(binding, var)) = globals.get(&(group, field.name.as_str())) else {
                return Err(BindingError::NotInShader {
                    block: block.name().to_string(),
                    field: field.name.clone(),
                    group,
                }
                .into());
            };
            let shader_ty = &module.types[var.ty].inner;
            let format = check_field(field.ty, var.space, shader_ty).map_err(|shader| {
                BindingError::IncompatibleField {
                    block: block.name().to_string(),
                    field: field.name.clone(),
                    declared: field.ty.to_string(),
                    shader,
                }
            })?;
            fields.push(ResolvedField {
                name: field.name.clone(),
                binding,
                ty: field.ty,
                format,
            });
        }
        blocks.push(fields);
    }

    let function_info = compiled.info.get_entry_point(ep_index);
    let mut uses_print = false;
    for (handle, var) in module.global_variables.iter() {
        if function_info[handle].is_empty() {
            continue;
        }
        let Some(binding) = &var.binding else {
            continue;
        };
        if Some(binding.group) == print_group {
            uses_print = true;
            continue;
        }
        let declared = schema
            .blocks()
            .get(binding.group as usize)
            .zip(var.name.as_deref())
            .is_some_and(|(block, name)| block.get(name).is_some());
        if !declared {
            return Err(BindingError::Undeclared {
                name: var.name.clone().unwrap_or_else(|| "<anonymous>".into()),
                group: binding.group,
                binding: binding.binding,
            }
            .into());
        }
    }

    Ok(Interface {
        blocks,
        workgroup_size: entry.workgroup_size,
        uses_print,
    })
}

/// Returns the storage format for storage textures, or a description of
/// the shader-side type on mismatch.
fn check_field(
    declared: FieldType,
    space: AddressSpace,
    shader_ty: &TypeInner,
) -> Result<Option<ResourceFormat>, String> {
    match (declared, space, shader_ty) {
        (FieldType::Uniform(expected), AddressSpace::Uniform, ty) => match uniform_value_type(ty) {
            Some(found) if found == expected => Ok(None),
            Some(found) => Err(format!("uniform {found}")),
            None => Err("an unsupported uniform type".to_string()),
        },
        (
            FieldType::StorageTexture(access),
            AddressSpace::Handle,
            TypeInner::Image {
                dim: ImageDimension::D2,
                arrayed: false,
                class: ImageClass::Storage { format, access: shader_access },
            },
        ) => {
            let shader_reads = shader_access.contains(StorageAccess::LOAD);
            let shader_writes = shader_access.contains(StorageAccess::STORE);
            if shader_reads != access.reads() || shader_writes != access.writes() {
                return Err(format!("storage texture with access {shader_access:?}"));
            }
            ResourceFormat::from_storage_format(*format)
                .map(Some)
                .ok_or_else(|| format!("storage texture of unsupported format {format:?}"))
        }
        (
            FieldType::SampledTexture,
            AddressSpace::Handle,
            TypeInner::Image {
                dim: ImageDimension::D2,
                arrayed: false,
                class: ImageClass::Sampled {
                    kind: naga::ScalarKind::Float,
                    multi: false,
                },
            },
        ) => Ok(None),
        (_, space, ty) => Err(format!("{ty:?} in {space:?}")),
    }
}

fn uniform_value_type(ty: &TypeInner) -> Option<ValueType> {
    let (scalar, components) = match *ty {
        TypeInner::Scalar(scalar) => (scalar, 1),
        TypeInner::Vector { size, scalar } => (scalar, size as u32),
        _ => return None,
    };
    if scalar.width != 4 {
        return None;
    }
    let kind = match scalar.kind {
        naga::ScalarKind::Float => ScalarKind::Float,
        naga::ScalarKind::Sint => ScalarKind::Int,
        naga::ScalarKind::Uint => ScalarKind::UInt,
        _ => return None,
    };
    ValueType::from_parts(kind, components)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::compute::gpu::program::SourceResolver;
    use crate::compute::gpu::HOSTLOG_INCLUDE;
    use crate::compute::gpu::hostlog::HOSTLOG_SHADER;
    use crate::schema::ParameterBlock;

    const SHADER: &str = "\
@group(0) @binding(0) var<uniform> Dimensions: vec2<u32>;
@group(0) @binding(1) var OutTexture: texture_storage_2d<rgba32float, write>;
@group(0) @binding(2) var Source: texture_2d<f32>;
@group(1) @binding(0) var<uniform> Gain: f32;

@compute @workgroup_size(8, 4, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= Dimensions.x || id.y >= Dimensions.y) {
        return;
    }
    let c = textureLoad(Source, vec2<i32>(id.xy), 0) * Gain;
    textureStore(OutTexture, vec2<i32>(id.xy), c);
}

@compute @workgroup_size(16, 16, 1)
fn clear(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(OutTexture, vec2<i32>(id.xy), vec4<f32>(0.0));
}
";

    fn compiled() -> CompiledSource {
        SourceResolver::new(vec![])
            .compile_source(Path::new("filter.wgsl"), SHADER, &["main", "clear"])
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn params_block() -> ParameterBlock {
        ParameterBlock::new("Params")
            .field("Dimensions", FieldType::Uniform(ValueType::UInt2))
            .field("OutTexture", FieldType::StorageTexture(Access::Write))
            .field("Source", FieldType::SampledTexture)
    }

    fn full_schema() -> KernelSchema {
        KernelSchema::new()
            .block(params_block())
            .block(ParameterBlock::new("Tuning").field("Gain", FieldType::Uniform(ValueType::Float)))
    }

    #[test]
    fn test_reflects_matching_schema() {
        let interface = reflect(&compiled(), "main", &full_schema(), None).unwrap();
        assert_eq!(interface.workgroup_size, [8, 4, 1]);
        assert!(!interface.uses_print);
        assert_eq!(interface.blocks.len(), 2);

        let out = &interface.blocks[0][1];
        assert_eq!(out.name, "OutTexture");
        assert_eq!(out.binding, 1);
        assert_eq!(out.format, Some(ResourceFormat::Rgba32Float));
        assert_eq!(interface.blocks[1][0].binding, 0);
    }

    #[test]
    fn test_used_global_must_be_declared() {
        let schema = KernelSchema::new().block(params_block());
        match reflect(&compiled(), "main", &schema, None) {
            Err(ReflectError::Binding(BindingError::Undeclared { name, group, .. })) => {
                assert_eq!(name, "Gain");
                assert_eq!(group, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unused_globals_may_be_omitted() {
        // `clear` only touches OutTexture, but declared fields must still exist.
        let schema = KernelSchema::new().block(
            ParameterBlock::new("Params").field("OutTexture", FieldType::StorageTexture(Access::Write)),
        );
        let interface = reflect(&compiled(), "clear", &schema, None).unwrap();
        assert_eq!(interface.workgroup_size, [16, 16, 1]);
    }

    #[test]
    fn test_field_missing_from_shader() {
        let schema = KernelSchema::new().block(
            ParameterBlock::new("Params")
                .field("OutTexture", FieldType::StorageTexture(Access::Write))
                .field("Offset", FieldType::Uniform(ValueType::UInt2)),
        );
        assert!(matches!(
            reflect(&compiled(), "clear", &schema, None),
            Err(ReflectError::Binding(BindingError::NotInShader { .. }))
        ));
    }

    #[test]
    fn test_incompatible_field_types() {
        let schema = KernelSchema::new().block(
            ParameterBlock::new("Params")
                .field("OutTexture", FieldType::StorageTexture(Access::ReadWrite)),
        );
        assert!(matches!(
            reflect(&compiled(), "clear", &schema, None),
            Err(ReflectError::Binding(BindingError::IncompatibleField { .. }))
        ));

        let schema = KernelSchema::new()
            .block(
                ParameterBlock::new("Params")
                    .field("Dimensions", FieldType::Uniform(ValueType::Int2))
                    .field("OutTexture", FieldType::StorageTexture(Access::Write))
                    .field("Source", FieldType::SampledTexture),
            )
            .block(ParameterBlock::new("Tuning").field("Gain", FieldType::Uniform(ValueType::Float)));
        assert!(matches!(
            reflect(&compiled(), "main", &schema, None),
            Err(ReflectError::Binding(BindingError::IncompatibleField { .. }))
        ));
    }

    #[test]
    fn test_duplicate_block_name_rejected() {
        // Every field exists in the shader; only the repeated block name is wrong.
        let schema = KernelSchema::new()
            .block(params_block())
            .block(ParameterBlock::new("Params").field("Gain", FieldType::Uniform(ValueType::Float)));
        assert!(matches!(
            reflect(&compiled(), "main", &schema, None),
            Err(ReflectError::Binding(BindingError::DuplicateBlock(name))) if name == "Params"
        ));
    }

    #[test]
    fn test_unknown_entry_point() {
        assert!(matches!(
            reflect(&compiled(), "missing", &full_schema(), None),
            Err(ReflectError::Compile(_))
        ));
    }

    #[test]
    fn test_print_group_detected() {
        let mut resolver = SourceResolver::new(vec![]);
        resolver.register_virtual(HOSTLOG_INCLUDE, HOSTLOG_SHADER);
        let source = "#include \"hostlog.wgsl\"\n@compute @workgroup_size(1)\nfn main() {\n    print_u32(1u, 2u, 3u, 4u);\n}\n";
        let compiled = resolver
            .compile_source(Path::new("p.wgsl"), source, &["main"])
            .unwrap_or_else(|e| panic!("{e}"));

        let interface = reflect(&compiled, "main", &KernelSchema::new(), Some(PRINT_GROUP)).unwrap();
        assert!(interface.uses_print);

        // Without print capture the buffer is an ordinary undeclared global.
        assert!(matches!(
            reflect(&compiled, "main", &KernelSchema::new(), None),
            Err(ReflectError::Binding(BindingError::Undeclared { .. }))
        ));

        let crowded = KernelSchema::new()
            .block(ParameterBlock::new("A"))
            .block(ParameterBlock::new("B"))
            .block(ParameterBlock::new("C"))
            .block(ParameterBlock::new("D"));
        assert!(matches!(
            reflect(&compiled, "main", &crowded, Some(PRINT_GROUP)),
            Err(ReflectError::Binding(BindingError::TooManyBlocks { count: 4, max: 3 }))
        ));
    }

    #[test]
    fn test_workgroup_count_ceil() {
        assert_eq!(workgroup_count([128, 128, 1], [8, 8, 1]), [16, 16, 1]);
        assert_eq!(workgroup_count([129, 7, 1], [8, 8, 1]), [17, 1, 1]);
        assert_eq!(workgroup_count([2, 2, 1], [8, 8, 1]), [1, 1, 1]);
    }
}
