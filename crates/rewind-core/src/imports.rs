//! Import interception.
//!
//! Host functions are supplied as [`HostFunc`]s in an [`ImportMap`]. Each one
//! is wrapped in a wasmtime [`Func`] that cooperates with the Asyncify state
//! machine:
//!
//! ```text
//! state == Rewinding  -> stop_rewind, return the resolved value (host not called)
//! state == None       -> call host
//!     Ready(values)   -> return values unchanged
//!     Pending(future) -> refresh stack hook, store future, start_unwind,
//!                        return placeholder zeros
//! state == Unwinding  -> protocol violation
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace};
use wasmtime::{Caller, ExternType, Func, FuncType, Linker, Module, Store, Val, ValType};

use crate::context::AsyncifyContext;
use rewind_common::{ExecutionState, HostFunctionError, ProtocolStateError, RuntimeError};

/// A host value that settles later.
pub type HostFuture =
    Pin<Box<dyn Future<Output = Result<Vec<Val>, HostFunctionError>> + Send + 'static>>;

/// What a host function produced for one call.
pub enum HostResult {
    /// Values available immediately; no suspension happens.
    Ready(Vec<Val>),
    /// The module unwinds and the call resumes once this settles.
    Pending(HostFuture),
}

impl HostResult {
    /// Wrap a future as a pending result.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Vec<Val>, HostFunctionError>> + Send + 'static,
    {
        HostResult::Pending(Box::pin(future))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, HostResult::Pending(_))
    }
}

type HostCallback = dyn for<'a> Fn(&mut Caller<'a, AsyncifyContext>, &[Val]) -> Result<HostResult, HostFunctionError>
    + Send
    + Sync;

/// A host function that may answer synchronously or with a future.
///
/// Cloning is cheap and preserves identity: the same `HostFunc` registered
/// under several names is wrapped only once per signature.
#[derive(Clone)]
pub struct HostFunc {
    callback: Arc<HostCallback>,
}

impl HostFunc {
    /// Create a host function with access to the calling instance.
    pub fn new<F>(callback: F) -> Self
    where
        F: for<'a> Fn(&mut Caller<'a, AsyncifyContext>, &[Val]) -> Result<HostResult, HostFunctionError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Create a host function that always answers immediately.
    pub fn sync<F>(callback: F) -> Self
    where
        F: Fn(&[Val]) -> Result<Vec<Val>, HostFunctionError> + Send + Sync + 'static,
    {
        Self::new(move |_caller, params| callback(params).map(HostResult::Ready))
    }

    /// Create a host function that always suspends on the returned future.
    pub fn future<F, Fut>(callback: F) -> Self
    where
        F: Fn(&[Val]) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Val>, HostFunctionError>> + Send + 'static,
    {
        Self::new(move |_caller, params| Ok(HostResult::pending(callback(params))))
    }

    /// Returns `true` if both handles refer to the same function.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.callback).cast::<()>() as usize
    }

    fn invoke(
        &self,
        caller: &mut Caller<'_, AsyncifyContext>,
        params: &[Val],
    ) -> Result<HostResult, HostFunctionError> {
        (self.callback)(caller, params)
    }
}

impl std::fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunc")
            .field("identity", &format_args!("{:#x}", self.identity()))
            .finish()
    }
}

/// Host functions keyed by import module and name.
#[derive(Debug, Clone, Default)]
pub struct ImportMap {
    modules: BTreeMap<String, BTreeMap<String, HostFunc>>,
}

impl ImportMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function, returning any function it replaced.
    pub fn insert(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        func: HostFunc,
    ) -> Option<HostFunc> {
        self.modules
            .entry(module.into())
            .or_default()
            .insert(name.into(), func)
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, module: impl Into<String>, name: impl Into<String>, func: HostFunc) -> Self {
        self.insert(module, name, func);
        self
    }

    pub fn get(&self, module: &str, name: &str) -> Option<&HostFunc> {
        self.modules.get(module)?.get(name)
    }

    pub fn len(&self) -> usize {
        self.modules.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over `(module, name, func)` in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &HostFunc)> {
        self.modules.iter().flat_map(|(module, funcs)| {
            funcs
                .iter()
                .map(move |(name, func)| (module.as_str(), name.as_str(), func))
        })
    }
}

/// `module::name` of the import a wrapper was first created for.
#[derive(Debug, Clone)]
struct ImportLabel {
    module: String,
    name: String,
}

impl std::fmt::Display for ImportLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

struct WrappedImport {
    // Keeps the callback alive so its address stays a valid identity key.
    _host: HostFunc,
    ty: FuncType,
    func: Func,
}

/// Per-instance cache of import wrappers.
///
/// Keyed by host function identity and signature, so wrapping the same host
/// function twice yields the same [`Func`].
#[derive(Default)]
pub(crate) struct ImportRegistry {
    wrappers: HashMap<usize, Vec<WrappedImport>>,
}

impl ImportRegistry {
    pub(crate) fn wrap(
        &mut self,
        store: &mut Store<AsyncifyContext>,
        module: &str,
        name: &str,
        host: &HostFunc,
        ty: FuncType,
    ) -> Func {
        let entries = self.wrappers.entry(host.identity()).or_default();
        if let Some(existing) = entries.iter().find(|w| FuncType::eq(&w.ty, &ty)) {
            trace!(module, name, "Reusing import wrapper");
            return existing.func;
        }

        let label = ImportLabel {
            module: module.to_string(),
            name: name.to_string(),
        };
        let func = wrap_import(store, label, host.clone(), ty.clone());
        entries.push(WrappedImport {
            _host: host.clone(),
            ty,
            func,
        });
        func
    }

    /// Number of distinct wrappers created.
    pub(crate) fn len(&self) -> usize {
        self.wrappers.values().map(Vec::len).sum()
    }
}

/// Define a wrapper for every function the module imports.
///
/// # Errors
///
/// Returns an error if an import is missing from `imports`, is not a
/// function, or cannot be defined in the linker.
pub(crate) fn link_imports(
    linker: &mut Linker<AsyncifyContext>,
    store: &mut Store<AsyncifyContext>,
    module: &Module,
    imports: &ImportMap,
    registry: &mut ImportRegistry,
) -> Result<(), RuntimeError> {
    for import in module.imports() {
        let (module_name, name) = (import.module(), import.name());

        let ExternType::Func(ty) = import.ty() else {
            return Err(RuntimeError::UnsupportedImport {
                module: module_name.to_string(),
                name: name.to_string(),
            });
        };

        let host = imports
            .get(module_name, name)
            .ok_or_else(|| RuntimeError::ImportNotProvided {
                module: module_name.to_string(),
                name: name.to_string(),
            })?;

        let func = registry.wrap(store, module_name, name, host, ty);
        linker
            .define(&*store, module_name, name, func)
            .map_err(|e| {
                RuntimeError::instantiation(format!("Failed to define {module_name}::{name}: {e}"))
            })?;
    }

    Ok(())
}

fn wrap_import(
    store: &mut Store<AsyncifyContext>,
    label: ImportLabel,
    host: HostFunc,
    ty: FuncType,
) -> Func {
    let result_types: Vec<ValType> = ty.results().collect();
    Func::new(&mut *store, ty, move |mut caller, params, results| {
        intercept(&mut caller, &label, &host, &result_types, params, results)
    })
}

fn intercept(
    caller: &mut Caller<'_, AsyncifyContext>,
    label: &ImportLabel,
    host: &HostFunc,
    result_types: &[ValType],
    params: &[Val],
    results: &mut [Val],
) -> wasmtime::Result<()> {
    let wired = caller
        .data()
        .controller()
        .ok()
        .map(|c| (c.ops(), c.data_addr(), c.memory(), c.stack_hook()));

    // Imports called from the start function run before wiring completes.
    let Some((ops, data_addr, memory, stack_hook)) = wired else {
        return match host.invoke(caller, params)? {
            HostResult::Ready(values) => write_results(label, values, results),
            HostResult::Pending(_) => Err(ProtocolStateError::NotInitialized.into()),
        };
    };

    match ops.state(&mut *caller)? {
        ExecutionState::Rewinding => {
            ops.stop_rewind(&mut *caller)?;
            let values = caller.data_mut().controller_mut()?.pending.take_resolved()?;
            debug!(import = %label, "Replayed import returned resolved value");
            return write_results(label, values, results);
        }
        state => state.expect(ExecutionState::None, "import call")?,
    }

    match host.invoke(caller, params)? {
        HostResult::Ready(values) => write_results(label, values, results),
        HostResult::Pending(future) => {
            // Nothing is suspended unless every result has a placeholder.
            let placeholders = placeholders(result_types)?;

            if let Some(hook) = stack_hook {
                hook.refresh(memory, &mut *caller, data_addr)?;
            }
            caller.data_mut().controller_mut()?.pending.suspend(future)?;
            ops.start_unwind(&mut *caller, data_addr)?;
            caller.data_mut().metrics.unwinds += 1;

            debug!(import = %label, data_addr, "Import suspended, unwinding");

            for (slot, value) in results.iter_mut().zip(placeholders) {
                *slot = value;
            }
            Ok(())
        }
    }
}

fn write_results(
    label: &ImportLabel,
    values: Vec<Val>,
    results: &mut [Val],
) -> wasmtime::Result<()> {
    if values.len() != results.len() {
        return Err(HostFunctionError::InvalidReturn {
            reason: format!(
                "{label} returned {} values, expected {}",
                values.len(),
                results.len()
            ),
        }
        .into());
    }

    for (slot, value) in results.iter_mut().zip(values) {
        *slot = value;
    }
    Ok(())
}

fn placeholders(result_types: &[ValType]) -> Result<Vec<Val>, HostFunctionError> {
    result_types.iter().map(placeholder).collect()
}

/// Value returned to the module while it unwinds; never observed.
fn placeholder(ty: &ValType) -> Result<Val, HostFunctionError> {
    match ty {
        ValType::I32 => Ok(Val::I32(0)),
        ValType::I64 => Ok(Val::I64(0)),
        ValType::F32 => Ok(Val::F32(0)),
        ValType::F64 => Ok(Val::F64(0)),
        ValType::V128 => Ok(Val::V128(0u128.into())),
        _ => Err(HostFunctionError::InvalidReturn {
            reason: format!("cannot suspend an import returning {ty}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_map_lookup() {
        let func = HostFunc::sync(|_| Ok(vec![Val::I32(1)]));
        let mut imports = ImportMap::new();

        assert!(imports.insert("env", "one", func.clone()).is_none());
        assert!(imports.insert("env", "one", func.clone()).is_some());
        imports.insert("wasi", "clock", func);

        assert_eq!(imports.len(), 2);
        assert!(imports.get("env", "one").is_some());
        assert!(imports.get("env", "two").is_none());
        assert!(imports.get("other", "one").is_none());

        let names: Vec<_> = imports.iter().map(|(m, n, _)| format!("{m}.{n}")).collect();
        assert_eq!(names, vec!["env.one", "wasi.clock"]);
    }

    #[test]
    fn test_host_func_identity() {
        let a = HostFunc::sync(|_| Ok(vec![]));
        let b = HostFunc::sync(|_| Ok(vec![]));

        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn test_host_result_pending() {
        assert!(HostResult::pending(async { Ok(vec![]) }).is_pending());
        assert!(!HostResult::Ready(vec![]).is_pending());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholder(&ValType::I32).unwrap().unwrap_i32(), 0);
        assert_eq!(placeholder(&ValType::I64).unwrap().unwrap_i64(), 0);
        assert!(placeholder(&ValType::F64).is_ok());
        assert!(placeholder(&ValType::EXTERNREF).is_err());
    }

    #[test]
    fn test_placeholders_fail_as_a_whole() {
        assert_eq!(placeholders(&[ValType::I32, ValType::F32]).unwrap().len(), 2);

        let err = placeholders(&[ValType::I32, ValType::EXTERNREF]).unwrap_err();
        assert!(matches!(err, HostFunctionError::InvalidReturn { .. }));
    }

    #[test]
    fn test_write_results_count_mismatch() {
        let label = ImportLabel {
            module: "env".into(),
            name: "pair".into(),
        };
        let mut results = [Val::I32(0), Val::I32(0)];

        let err = write_results(&label, vec![Val::I32(1)], &mut results).unwrap_err();
        let err = err.downcast::<HostFunctionError>().unwrap();
        assert!(err.to_string().contains("env::pair returned 1 values, expected 2"));

        write_results(&label, vec![Val::I32(1), Val::I32(2)], &mut results).unwrap();
        assert_eq!(results[1].unwrap_i32(), 2);
    }
}
