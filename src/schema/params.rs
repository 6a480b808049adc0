//! Kernel parameter schema and dispatch-time bindings.
//!
//! A kernel declares its interface once as a [`KernelSchema`]: an ordered
//! list of [`ParameterBlock`]s, where block `i` corresponds to WGSL
//! `@group(i)` and each field names a global variable in that group.
//! Every dispatch supplies [`Bindings`] which must cover the schema exactly.

use std::collections::BTreeMap;
use std::fmt;

use crate::compute::gpu::ResourceId;

/// Scalar or vector type of a uniform field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    UInt,
    UInt2,
    UInt3,
    UInt4,
}

/// Element kind of a [`ValueType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Float,
    Int,
    UInt,
}

impl ValueType {
    /// Build a value type from its element kind and component count (1-4).
    pub fn from_parts(kind: ScalarKind, components: u32) -> Option<Self> {
        use ValueType::*;
        let ty = match (kind, components) {
            (ScalarKind::Float, 1) => Float,
            (ScalarKind::Float, 2) => Float2,
            (ScalarKind::Float, 3) => Float3,
            (ScalarKind::Float, 4) => Float4,
            (ScalarKind::Int, 1) => Int,
            (ScalarKind::Int, 2) => Int2,
            (ScalarKind::Int, 3) => Int3,
            (ScalarKind::Int, 4) => Int4,
            (ScalarKind::UInt, 1) => UInt,
            (ScalarKind::UInt, 2) => UInt2,
            (ScalarKind::UInt, 3) => UInt3,
            (ScalarKind::UInt, 4) => UInt4,
            _ => return None,
        };
        Some(ty)
    }

    pub fn kind(self) -> ScalarKind {
        use ValueType::*;
        match self {
            Float | Float2 | Float3 | Float4 => ScalarKind::Float,
            Int | Int2 | Int3 | Int4 => ScalarKind::Int,
            UInt | UInt2 | UInt3 | UInt4 => ScalarKind::UInt,
        }
    }

    pub fn components(self) -> u32 {
        use ValueType::*;
        match self {
            Float | Int | UInt => 1,
            Float2 | Int2 | UInt2 => 2,
            Float3 | Int3 | UInt3 => 3,
            Float4 | Int4 | UInt4 => 4,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scalar = match self.kind() {
            ScalarKind::Float => "f32",
            ScalarKind::Int => "i32",
            ScalarKind::UInt => "u32",
        };
        match self.components() {
            1 => write!(f, "{scalar}"),
            n => write!(f, "vec{n}<{scalar}>"),
        }
    }
}

/// A uniform value supplied at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Float(f32),
    Float2([f32; 2]),
    Float3([f32; 3]),
    Float4([f32; 4]),
    Int(i32),
    Int2([i32; 2]),
    Int3([i32; 3]),
    Int4([i32; 4]),
    UInt(u32),
    UInt2([u32; 2]),
    UInt3([u32; 3]),
    UInt4([u32; 4]),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Float(_) => ValueType::Float,
            Value::Float2(_) => ValueType::Float2,
            Value::Float3(_) => ValueType::Float3,
            Value::Float4(_) => ValueType::Float4,
            Value::Int(_) => ValueType::Int,
            Value::Int2(_) => ValueType::Int2,
            Value::Int3(_) => ValueType::Int3,
            Value::Int4(_) => ValueType::Int4,
            Value::UInt(_) => ValueType::UInt,
            Value::UInt2(_) => ValueType::UInt2,
            Value::UInt3(_) => ValueType::UInt3,
            Value::UInt4(_) => ValueType::UInt4,
        }
    }

    /// Uniform buffer contents, zero-padded to 16 bytes.
    pub fn to_uniform_bytes(&self) -> [u8; 16] {
        let mut words = [0u32; 4];
        match *self {
            Value::Float(v) => words[0] = v.to_bits(),
            Value::Float2(v) => copy_words(&mut words, &v.map(f32::to_bits)),
            Value::Float3(v) => copy_words(&mut words, &v.map(f32::to_bits)),
            Value::Float4(v) => copy_words(&mut words, &v.map(f32::to_bits)),
            Value::Int(v) => words[0] = v as u32,
            Value::Int2(v) => copy_words(&mut words, &v.map(|x| x as u32)),
            Value::Int3(v) => copy_words(&mut words, &v.map(|x| x as u32)),
            Value::Int4(v) => copy_words(&mut words, &v.map(|x| x as u32)),
            Value::UInt(v) => words[0] = v,
            Value::UInt2(v) => copy_words(&mut words, &v),
            Value::UInt3(v) => copy_words(&mut words, &v),
            Value::UInt4(v) => copy_words(&mut words, &v),
        }
        bytemuck::cast(words)
    }
}

fn copy_words(dst: &mut [u32; 4], src: &[u32]) {
    dst[..src.len()].copy_from_slice(src);
}

/// Shader access mode of a storage texture field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Declared type of a parameter block field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// `var<uniform>` of a scalar or vector type.
    Uniform(ValueType),
    /// `texture_storage_2d<format, access>`.
    StorageTexture(Access),
    /// `texture_2d<f32>`, read without a sampler.
    SampledTexture,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Uniform(ty) => write!(f, "uniform {ty}"),
            FieldType::StorageTexture(access) => write!(f, "storage texture ({access:?})"),
            FieldType::SampledTexture => write!(f, "sampled texture"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: String,
    pub ty: FieldType,
}

/// A named group of fields bound together as one bind group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBlock {
    name: String,
    fields: Vec<FieldDecl>,
}

impl ParameterBlock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a field. A repeated name replaces the earlier declaration.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => existing.ty = ty,
            None => self.fields.push(FieldDecl { name, ty }),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Complete parameter interface of a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSchema {
    blocks: Vec<ParameterBlock>,
}

impl KernelSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block; its position is its bind group index.
    pub fn block(mut self, block: ParameterBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }

    pub fn block_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }

    /// First block name that appears more than once, if any.
    pub fn duplicate_block(&self) -> Option<&str> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(i, b)| self.blocks[..*i].iter().any(|prev| prev.name == b.name))
            .map(|(_, b)| b.name.as_str())
    }

    /// Check that `bindings` supplies exactly the declared blocks and fields
    /// with matching types.
    pub fn validate(&self, bindings: &Bindings) -> Result<(), BindingError> {
        if let Some(name) = self.duplicate_block() {
            return Err(BindingError::DuplicateBlock(name.to_string()));
        }

        for block_name in bindings.blocks.keys() {
            if self.block_index(block_name).is_none() {
                return Err(BindingError::UnknownBlock(block_name.clone()));
            }
        }

        for block in &self.blocks {
            let Some(supplied) = bindings.blocks.get(&block.name) else {
                if block.fields.is_empty() {
                    continue;
                }
                return Err(BindingError::MissingBlock(block.name.clone()));
            };

            for field_name in supplied.keys() {
                if block.get(field_name).is_none() {
                    return Err(BindingError::UnknownField {
                        block: block.name.clone(),
                        field: field_name.clone(),
                    });
                }
            }

            for field in &block.fields {
                let Some(binding) = supplied.get(&field.name) else {
                    return Err(BindingError::MissingField {
                        block: block.name.clone(),
                        field: field.name.clone(),
                    });
                };
                check_binding_type(&block.name, field, binding)?;
            }
        }
        Ok(())
    }
}

fn check_binding_type(block: &str, field: &FieldDecl, binding: &Binding) -> Result<(), BindingError> {
    let ok = match (field.ty, binding) {
        (FieldType::Uniform(expected), Binding::Value(value)) => value.value_type() == expected,
        (FieldType::Uniform(_), Binding::Resource(_)) => false,
        (_, Binding::Resource(_)) => true,
        (_, Binding::Value(_)) => false,
    };
    if ok {
        return Ok(());
    }
    Err(BindingError::TypeMismatch {
        block: block.to_string(),
        field: field.name.clone(),
        expected: field.ty.to_string(),
        found: binding.describe(),
    })
}

/// A single value or resource bound to a field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Binding {
    Value(Value),
    Resource(ResourceId),
}

impl Binding {
    fn describe(&self) -> String {
        match self {
            Binding::Value(v) => format!("uniform {}", v.value_type()),
            Binding::Resource(id) => format!("resource {id}"),
        }
    }
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Value(value)
    }
}

impl From<ResourceId> for Binding {
    fn from(id: ResourceId) -> Self {
        Binding::Resource(id)
    }
}

/// Dispatch-time variables: block name -> field name -> binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    blocks: BTreeMap<String, BTreeMap<String, Binding>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Bindings::insert`].
    pub fn set(mut self, block: &str, field: &str, binding: impl Into<Binding>) -> Self {
        self.insert(block, field, binding);
        self
    }

    pub fn insert(&mut self, block: &str, field: &str, binding: impl Into<Binding>) {
        self.blocks
            .entry(block.to_string())
            .or_default()
            .insert(field.to_string(), binding.into());
    }

    pub fn remove(&mut self, block: &str, field: &str) -> Option<Binding> {
        self.blocks.get_mut(block)?.remove(field)
    }

    pub fn get(&self, block: &str, field: &str) -> Option<&Binding> {
        self.blocks.get(block)?.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.values().all(BTreeMap::is_empty)
    }
}

/// Mismatch between supplied bindings, the kernel schema and the shader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("Unknown parameter block `{0}`")]
    UnknownBlock(String),
    #[error("Parameter block `{0}` is declared more than once")]
    DuplicateBlock(String),
    #[error("Parameter block `{0}` was not supplied")]
    MissingBlock(String),
    #[error("Unknown field `{block}.{field}`")]
    UnknownField { block: String, field: String },
    #[error("Field `{block}.{field}` was not supplied")]
    MissingField { block: String, field: String },
    #[error("Field `{block}.{field}` expects {expected}, got {found}")]
    TypeMismatch {
        block: String,
        field: String,
        expected: String,
        found: String,
    },
    #[error("Resource bound to `{block}.{field}` lacks {required} usage")]
    MissingUsage {
        block: String,
        field: String,
        required: &'static str,
    },
    #[error("Resource bound to `{block}.{field}` has format {found}, shader expects {expected}")]
    FormatMismatch {
        block: String,
        field: String,
        expected: String,
        found: String,
    },
    #[error("Shader has no global `{field}` in @group({group}) for block `{block}`")]
    NotInShader {
        block: String,
        field: String,
        group: u32,
    },
    #[error("Field `{block}.{field}` is declared as {declared}, shader declares {shader}")]
    IncompatibleField {
        block: String,
        field: String,
        declared: String,
        shader: String,
    },
    #[error("Shader global `{name}` at @group({group}) @binding({binding}) is not declared by the kernel schema")]
    Undeclared { name: String, group: u32, binding: u32 },
    #[error("Kernel schema declares {count} parameter blocks, at most {max} are available")]
    TooManyBlocks { count: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::gpu::ResourceId;

    fn uv_schema() -> KernelSchema {
        KernelSchema::new().block(
            ParameterBlock::new("Params")
                .field("Dimensions", FieldType::Uniform(ValueType::UInt2))
                .field("OutTexture", FieldType::StorageTexture(Access::Write)),
        )
    }

    fn full_bindings() -> Bindings {
        Bindings::new()
            .set("Params", "Dimensions", Value::UInt2([4, 4]))
            .set("Params", "OutTexture", ResourceId::new(0, 0))
    }

    #[test]
    fn test_exact_bindings_accepted() {
        assert_eq!(uv_schema().validate(&full_bindings()), Ok(()));
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut bindings = full_bindings();
        bindings.remove("Params", "Dimensions");
        assert_eq!(
            uv_schema().validate(&bindings),
            Err(BindingError::MissingField {
                block: "Params".into(),
                field: "Dimensions".into(),
            })
        );
    }

    #[test]
    fn test_extra_field_rejected() {
        let bindings = full_bindings().set("Params", "Scale", Value::Float(2.0));
        assert!(matches!(
            uv_schema().validate(&bindings),
            Err(BindingError::UnknownField { field, .. }) if field == "Scale"
        ));
    }

    #[test]
    fn test_unknown_and_missing_block() {
        let bindings = full_bindings().set("Extra", "X", Value::UInt(1));
        assert_eq!(
            uv_schema().validate(&bindings),
            Err(BindingError::UnknownBlock("Extra".into()))
        );
        assert_eq!(
            uv_schema().validate(&Bindings::new()),
            Err(BindingError::MissingBlock("Params".into()))
        );
    }

    #[test]
    fn test_duplicate_block_never_satisfiable() {
        let schema = KernelSchema::new()
            .block(ParameterBlock::new("Params").field("A", FieldType::Uniform(ValueType::Float)))
            .block(ParameterBlock::new("Params").field("B", FieldType::Uniform(ValueType::Float)));
        assert_eq!(schema.duplicate_block(), Some("Params"));
        assert_eq!(uv_schema().duplicate_block(), None);

        let bindings = Bindings::new()
            .set("Params", "A", Value::Float(1.0))
            .set("Params", "B", Value::Float(2.0));
        assert_eq!(
            schema.validate(&bindings),
            Err(BindingError::DuplicateBlock("Params".into()))
        );
    }

    #[test]
    fn test_type_mismatch() {
        let bindings = full_bindings().set("Params", "Dimensions", Value::Float2([4.0, 4.0]));
        assert!(matches!(
            uv_schema().validate(&bindings),
            Err(BindingError::TypeMismatch { .. })
        ));

        let bindings = full_bindings().set("Params", "OutTexture", Value::UInt(0));
        assert!(matches!(
            uv_schema().validate(&bindings),
            Err(BindingError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_uniform_bytes_padded() {
        let bytes = Value::UInt2([3, 7]).to_uniform_bytes();
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(&bytes[8..], &[0u8; 8]);

        let bytes = Value::Float(1.0).to_uniform_bytes();
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_value_type_display() {
        assert_eq!(ValueType::UInt2.to_string(), "vec2<u32>");
        assert_eq!(ValueType::Float.to_string(), "f32");
        assert_eq!(
            ValueType::from_parts(ScalarKind::Int, 3),
            Some(ValueType::Int3)
        );
        assert_eq!(ValueType::from_parts(ScalarKind::Int, 5), None);
    }

    #[test]
    fn test_field_redeclaration_replaces() {
        let block = ParameterBlock::new("P")
            .field("A", FieldType::Uniform(ValueType::Float))
            .field("A", FieldType::Uniform(ValueType::UInt));
        assert_eq!(block.fields().len(), 1);
        assert_eq!(block.fields()[0].ty, FieldType::Uniform(ValueType::UInt));
    }
}
