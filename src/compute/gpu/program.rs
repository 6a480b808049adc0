//! Shader source resolution and compilation.
//!
//! Sources are WGSL with one extension: a line of the form
//! `#include "name.wgsl"` is replaced by the contents of that file. Includes
//! resolve against the including file's directory, then the device include
//! paths, then the registered virtual files. Each file is expanded at most
//! once per program.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};

/// Shader compilation failure with its source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub file: PathBuf,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

impl CompileError {
    pub(crate) fn new(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
            message: message.into(),
        }
    }

    fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(column) = self.column {
                write!(f, ":{column}")?;
            }
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// A compiled program owned by a [`super::Device`].
pub struct Program {
    pub(crate) name: String,
    pub(crate) compiled: CompiledSource,
    pub(crate) shader: wgpu::ShaderModule,
}

impl Program {
    /// Source identifier (path or in-memory name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry points requested at load time, all verified to exist.
    pub fn entry_points(&self) -> &[String] {
        &self.compiled.entry_points
    }

    /// Flattened source after include expansion.
    pub fn source(&self) -> &str {
        &self.compiled.source
    }
}

/// Parsed and validated WGSL, independent of any device.
pub(crate) struct CompiledSource {
    pub source: String,
    pub module: naga::Module,
    pub info: ModuleInfo,
    pub entry_points: Vec<String>,
}

impl CompiledSource {
    /// Index of a compute entry point in `module.entry_points`.
    pub fn entry_point_index(&self, name: &str) -> Option<usize> {
        self.module
            .entry_points
            .iter()
            .position(|ep| ep.name == name && ep.stage == naga::ShaderStage::Compute)
    }
}

/// Flattened source plus the origin of every line.
struct Flattened {
    text: String,
    files: Vec<PathBuf>,
    lines: Vec<(usize, u32)>,
}

impl Flattened {
    fn new() -> Self {
        Self {
            text: String::new(),
            files: Vec::new(),
            lines: Vec::new(),
        }
    }

    fn file_index(&mut self, path: &Path) -> usize {
        match self.files.iter().position(|p| p == path) {
            Some(i) => i,
            None => {
                self.files.push(path.to_path_buf());
                self.files.len() - 1
            }
        }
    }

    fn push_line(&mut self, file: usize, line: u32, text: &str) {
        self.text.push_str(text);
        self.text.push('\n');
        self.lines.push((file, line));
    }

    /// Map a 1-based line of the flattened text to its origin.
    fn origin(&self, line: u32) -> Option<(&Path, u32)> {
        let (file, line) = *self.lines.get(line.checked_sub(1)? as usize)?;
        Some((self.files[file].as_path(), line))
    }

    fn error(&self, fallback: &Path, location: Option<naga::SourceLocation>, message: String) -> CompileError {
        match location.and_then(|loc| self.origin(loc.line_number).map(|o| (o, loc))) {
            Some(((file, line), loc)) => CompileError::new(file, message).at(line, loc.line_position),
            None => CompileError::new(fallback, message),
        }
    }
}

/// Resolves source paths and includes.
pub(crate) struct SourceResolver {
    include_paths: Vec<PathBuf>,
    virtual_files: HashMap<String, &'static str>,
}

impl SourceResolver {
    pub fn new(include_paths: Vec<PathBuf>) -> Self {
        Self {
            include_paths,
            virtual_files: HashMap::new(),
        }
    }

    pub fn register_virtual(&mut self, name: &str, source: &'static str) {
        self.virtual_files.insert(name.to_string(), source);
    }

    /// Locate a top-level source file.
    pub fn resolve_source(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }
        self.include_paths
            .iter()
            .map(|dir| dir.join(path))
            .chain(std::iter::once(path.to_path_buf()))
            .find(|candidate| candidate.is_file())
    }

    /// Read, expand and compile a source file.
    pub fn compile_file(&self, path: &Path, entry_points: &[&str]) -> Result<CompiledSource, CompileError> {
        let resolved = self
            .resolve_source(path)
            .ok_or_else(|| CompileError::new(path, "shader source not found in include paths"))?;
        let text = fs::read_to_string(&resolved)
            .map_err(|e| CompileError::new(&resolved, format!("cannot read shader source: {e}")))?;
        self.compile_source(&resolved, &text, entry_points)
    }

    /// Expand and compile an in-memory source.
    pub fn compile_source(
        &self,
        name: &Path,
        text: &str,
        entry_points: &[&str],
    ) -> Result<CompiledSource, CompileError> {
        let mut flat = Flattened::new();
        let mut seen = HashSet::new();
        seen.insert(canonical(name));
        self.expand(name, text, &mut flat, &mut seen)?;

        let module = naga::front::wgsl::parse_str(&flat.text).map_err(|e| {
            log::debug!("{}", e.emit_to_string(&flat.text));
            flat.error(name, e.location(&flat.text), e.message().to_string())
        })?;

        let info = Validator::new(ValidationFlags::all(), Capabilities::default())
            .validate(&module)
            .map_err(|e| {
                log::debug!("{}", e.emit_to_string(&flat.text));
                flat.error(name, e.location(&flat.text), e.as_inner().to_string())
            })?;

        let compiled = CompiledSource {
            source: flat.text,
            module,
            info,
            entry_points: entry_points.iter().map(|s| s.to_string()).collect(),
        };

        for entry in entry_points {
            if compiled.entry_point_index(entry).is_none() {
                return Err(CompileError::new(
                    name,
                    format!("compute entry point `{entry}` not found"),
                ));
            }
        }
        Ok(compiled)
    }

    fn expand(
        &self,
        name: &Path,
        text: &str,
        flat: &mut Flattened,
        seen: &mut HashSet<PathBuf>,
    ) -> Result<(), CompileError> {
        let file = flat.file_index(name);
        let mut comment_depth = 0;
        for (i, line) in text.lines().enumerate() {
            let line_number = i as u32 + 1;
            let in_comment = comment_depth > 0;
            comment_depth = block_comment_depth(line, comment_depth);
            let Some(target) = parse_include(line).filter(|_| !in_comment) else {
                flat.push_line(file, line_number, line);
                continue;
            };
            // Keep line numbering of the including file intact.
            flat.push_line(file, line_number, "");

            let column = line.find("#include").map_or(1, |c| c as u32 + 1);
            let include = self.resolve_include(target, name.parent()).ok_or_else(|| {
                CompileError::new(name, format!("cannot resolve include \"{target}\""))
                    .at(line_number, column)
            })?;

            match include {
                Include::File(path) => {
                    if !seen.insert(canonical(&path)) {
                        continue;
                    }
                    let source = fs::read_to_string(&path).map_err(|e| {
                        CompileError::new(name, format!("cannot read include {}: {e}", path.display()))
                            .at(line_number, column)
                    })?;
                    self.expand(&path, &source, flat, seen)?;
                }
                Include::Virtual(source) => {
                    let path = PathBuf::from(target);
                    if !seen.insert(path.clone()) {
                        continue;
                    }
                    self.expand(&path, source, flat, seen)?;
                }
            }
        }
        Ok(())
    }

    fn resolve_include(&self, target: &str, dir: Option<&Path>) -> Option<Include> {
        let relative = Path::new(target);
        let found = dir
            .map(|d| d.join(relative))
            .into_iter()
            .chain(self.include_paths.iter().map(|p| p.join(relative)))
            .find(|candidate| candidate.is_file());
        if let Some(path) = found {
            return Some(Include::File(path));
        }
        self.virtual_files.get(target).copied().map(Include::Virtual)
    }
}

enum Include {
    File(PathBuf),
    Virtual(&'static str),
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Extract the target of an `#include "x"` or `#include <x>` line.
fn parse_include(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("#include")?.trim();
    let (open, close) = match rest.chars().next()? {
        '"' => ('"', '"'),
        '<' => ('<', '>'),
        _ => return None,
    };
    let inner = rest.strip_prefix(open)?;
    let end = inner.find(close)?;
    Some(&inner[..end])
}

/// Nesting depth of WGSL `/* */` comments after scanning `line`.
fn block_comment_depth(line: &str, mut depth: u32) -> u32 {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'/') if depth == 0 => break,
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') if depth > 0 => {
                depth -= 1;
                i += 2;
            }
            _ => i += 1,
        }
    }
    depth
}
