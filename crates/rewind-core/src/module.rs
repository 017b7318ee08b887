//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's
//! [`Module`] that validates input bytes, records a content hash, and reports
//! whether the module carries the Asyncify control surface.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{info, instrument, warn};
use wasmparser::{ExternalKind, Parser, Payload};
use wasmtime::{Engine, ExternType, Module};

use crate::controller::CONTROL_OPERATIONS;
use rewind_common::{AsyncifyConfig, RuntimeError};

/// A compiled core WebAssembly module.
///
/// `CompiledModule` is cheap to clone and can be instantiated any number of
/// times; every instance gets its own save area and controller.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,

    /// Hash of the original Wasm bytes (or WAT source).
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,

    /// Function index behind each exported function name. Aliased exports
    /// share an index.
    export_funcs: HashMap<String, u32>,
}

/// Kind of an import or export, for inspection output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Func,
    Global,
    Memory,
    Table,
    Other,
}

impl From<&ExternType> for ItemKind {
    fn from(ty: &ExternType) -> Self {
        match ty {
            ExternType::Func(_) => ItemKind::Func,
            ExternType::Global(_) => ItemKind::Global,
            ExternType::Memory(_) => ItemKind::Memory,
            ExternType::Table(_) => ItemKind::Table,
            #[allow(unreachable_patterns)]
            _ => ItemKind::Other,
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Func => write!(f, "func"),
            ItemKind::Global => write!(f, "global"),
            ItemKind::Memory => write!(f, "memory"),
            ItemKind::Table => write!(f, "table"),
            ItemKind::Other => write!(f, "other"),
        }
    }
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;
        let compiled = Self::compile(engine, bytes, compute_hash(bytes))?;

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(compiled)
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or compilation fails.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let bytes = wat::parse_str(wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;
        let compiled = Self::compile(engine, &bytes, compute_hash(wat.as_bytes()))?;

        info!(
            content_hash = %compiled.content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(compiled)
    }

    fn compile(engine: &Engine, bytes: &[u8], content_hash: String) -> Result<Self, RuntimeError> {
        let module = Module::new(engine, bytes).map_err(|e| {
            RuntimeError::compilation_failed(format!("Core module compilation failed: {e}"))
        })?;
        let export_funcs = export_func_indices(bytes)?;

        Ok(Self {
            module,
            content_hash,
            compiled_at: Instant::now(),
            export_funcs,
        })
    }

    /// Compile a module from a `.wasm` or `.wat` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not compile.
    #[instrument(skip(engine, path), fields(path = %path.as_ref().display()))]
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;

        if path.extension().is_some_and(|ext| ext == "wat") {
            let text = String::from_utf8(bytes).map_err(|e| {
                RuntimeError::compilation_failed(format!("WAT file is not UTF-8: {e}"))
            })?;
            return Self::from_wat(engine, &text);
        }

        Self::from_bytes(engine, &bytes)
    }

    /// Names of the Asyncify control exports this module lacks.
    ///
    /// An empty result means the module can be instantiated as an
    /// [`AsyncInstance`](crate::AsyncInstance).
    pub fn missing_control_exports(&self, config: &AsyncifyConfig) -> Vec<String> {
        let missing: Vec<String> = CONTROL_OPERATIONS
            .iter()
            .map(|op| config.control_export(op))
            .filter(|name| {
                !self
                    .module
                    .exports()
                    .any(|export| export.name() == name && matches!(export.ty(), ExternType::Func(_)))
            })
            .collect();

        if !missing.is_empty() {
            warn!(
                content_hash = %self.content_hash,
                missing = ?missing,
                "Module is not Asyncify-instrumented"
            );
        }

        missing
    }

    /// Imports declared by the module as `(module, name, kind)`.
    pub fn imports(&self) -> Vec<(String, String, ItemKind)> {
        self.module
            .imports()
            .map(|import| {
                (
                    import.module().to_string(),
                    import.name().to_string(),
                    ItemKind::from(&import.ty()),
                )
            })
            .collect()
    }

    /// Exports declared by the module as `(name, kind)`.
    pub fn exports(&self) -> Vec<(String, ItemKind)> {
        self.module
            .exports()
            .map(|export| (export.name().to_string(), ItemKind::from(&export.ty())))
            .collect()
    }

    /// Function index of an exported function, shared by every name that
    /// exports it.
    pub fn export_func_index(&self, name: &str) -> Option<u32> {
        self.export_funcs.get(name).copied()
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.module
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Map each exported function name to its function index.
fn export_func_indices(bytes: &[u8]) -> Result<HashMap<String, u32>, RuntimeError> {
    let mut indices = HashMap::new();
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = payload.map_err(|e| {
            RuntimeError::compilation_failed(format!("Failed to read export section: {e}"))
        })?;
        match payload {
            Payload::ExportSection(section) => {
                for export in section {
                    let export = export.map_err(|e| {
                        RuntimeError::compilation_failed(format!("Malformed export: {e}"))
                    })?;
                    if export.kind == ExternalKind::Func {
                        indices.insert(export.name.to_string(), export.index);
                    }
                }
            }
            Payload::End(_) => break,
            _ => {}
        }
    }
    Ok(indices)
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use rewind_common::EngineConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_validate_wasm_header() {
        assert!(CompiledModule::validate_wasm_header(MINIMAL_WASM).is_ok());
        assert!(CompiledModule::validate_wasm_header(&[0x00, 0x61]).is_err());

        let bad_magic = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        assert!(CompiledModule::validate_wasm_header(bad_magic).is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_empty_module_lacks_control_exports() {
        let engine = engine();
        let module = CompiledModule::from_bytes(engine.inner(), MINIMAL_WASM).unwrap();

        let missing = module.missing_control_exports(&AsyncifyConfig::default());
        assert_eq!(missing.len(), CONTROL_OPERATIONS.len());
        assert!(missing.contains(&"asyncify_get_state".to_string()));
    }

    #[test]
    fn test_partial_control_surface() {
        let engine = engine();
        let module = CompiledModule::from_wat(
            engine.inner(),
            r#"
            (module
                (func (export "asyncify_get_state") (result i32) (i32.const 0))
                (func (export "asyncify_stop_unwind"))
                (global (export "asyncify_stop_rewind") i32 (i32.const 0)))
            "#,
        )
        .unwrap();

        let missing = module.missing_control_exports(&AsyncifyConfig::default());
        assert_eq!(
            missing,
            vec![
                "asyncify_start_unwind".to_string(),
                "asyncify_start_rewind".to_string(),
                "asyncify_stop_rewind".to_string(),
            ]
        );
    }

    #[test]
    fn test_inspection() {
        let engine = engine();
        let module = CompiledModule::from_wat(
            engine.inner(),
            r#"
            (module
                (import "env" "sleep_ms" (func (param i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "main")))
            "#,
        )
        .unwrap();

        assert_eq!(
            module.imports(),
            vec![("env".to_string(), "sleep_ms".to_string(), ItemKind::Func)]
        );
        assert_eq!(
            module.exports(),
            vec![
                ("memory".to_string(), ItemKind::Memory),
                ("main".to_string(), ItemKind::Func),
            ]
        );
    }

    #[test]
    fn test_aliased_exports_share_index() {
        let engine = engine();
        let module = CompiledModule::from_wat(
            engine.inner(),
            r#"
            (module
                (func $f)
                (func $g)
                (memory (export "memory") 1)
                (export "a" (func $f))
                (export "b" (func $f))
                (export "c" (func $g)))
            "#,
        )
        .unwrap();

        assert_eq!(module.export_func_index("a"), Some(0));
        assert_eq!(module.export_func_index("b"), Some(0));
        assert_eq!(module.export_func_index("c"), Some(1));
        assert_eq!(module.export_func_index("memory"), None);
    }

    #[test]
    fn test_invalid_wat() {
        let engine = engine();
        let result = CompiledModule::from_wat(engine.inner(), "(module (func");
        assert!(matches!(
            result,
            Err(RuntimeError::CompilationFailed { .. })
        ));
    }
}
