//! Export interception.
//!
//! A [`WrappedExport`] turns one synchronous module export into an async
//! call. The driving loop repeats the export until the module stops
//! unwinding:
//!
//! ```text
//! assert None ─► call export ─► state == Unwinding? ──no──► assert None ─► results
//!                    ▲                 │ yes
//!                    │          stop_unwind, await pending value,
//!                    │          assert None, start_rewind
//!                    └─────────────────┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};
use wasmtime::{Func, FuncType, Store, Val};

use crate::context::AsyncifyContext;
use crate::controller::{ControlOps, classify, recover};
use rewind_common::{ExecutionState, ProtocolStateError, RuntimeError};

/// Async wrapper around a module export.
///
/// Cheap to clone. Asking an instance for the same function twice, under
/// the same name or an alias, returns wrappers that are
/// [`ptr_eq`](Self::ptr_eq).
#[derive(Clone)]
pub struct WrappedExport {
    inner: Arc<ExportInner>,
}

struct ExportInner {
    name: String,
    func: Func,
    ty: FuncType,
}

impl WrappedExport {
    /// The first name this function was exported under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn ty(&self) -> &FuncType {
        &self.inner.ty
    }

    /// Returns `true` if both handles wrap the same export.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn result_buffer(&self) -> Vec<Val> {
        vec![Val::I32(0); self.inner.ty.results().len()]
    }
}

impl std::fmt::Debug for WrappedExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedExport")
            .field("name", &self.inner.name)
            .field("ty", &self.inner.ty)
            .finish_non_exhaustive()
    }
}

/// Per-instance cache of export wrappers.
///
/// Wrappers are keyed by function index, so every name that exports the
/// same function resolves to one wrapper.
#[derive(Default)]
pub(crate) struct ExportRegistry {
    by_name: BTreeMap<String, WrappedExport>,
    by_index: HashMap<u32, WrappedExport>,
}

impl ExportRegistry {
    /// Wrap `func`, exported as `name`. `index` is the module's function
    /// index, when known.
    pub(crate) fn wrap(
        &mut self,
        name: &str,
        index: Option<u32>,
        func: Func,
        ty: FuncType,
    ) -> WrappedExport {
        if let Some(existing) = self.by_name.get(name) {
            return existing.clone();
        }

        let wrapped = match index.and_then(|index| self.by_index.get(&index)) {
            Some(alias) => alias.clone(),
            None => WrappedExport {
                inner: Arc::new(ExportInner {
                    name: name.to_string(),
                    func,
                    ty,
                }),
            },
        };

        if let Some(index) = index {
            self.by_index.entry(index).or_insert_with(|| wrapped.clone());
        }
        self.by_name.insert(name.to_string(), wrapped.clone());
        wrapped
    }

    pub(crate) fn get(&self, name: &str) -> Option<WrappedExport> {
        self.by_name.get(name).cloned()
    }

    /// Returns `true` if `export` was created by this registry.
    pub(crate) fn owns(&self, export: &WrappedExport) -> bool {
        self.by_name
            .get(export.name())
            .is_some_and(|own| own.ptr_eq(export))
    }

    /// Every exported name, aliases included.
    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Number of distinct wrapped functions.
    pub(crate) fn len(&self) -> usize {
        self.by_name
            .iter()
            .filter(|(name, export)| export.name() == name.as_str())
            .count()
    }
}

/// Run one logical export call to completion, suspending as often as the
/// module's imports ask to.
///
/// `segment_ticks` re-arms the epoch deadline before each synchronous
/// segment when epoch interruption is enabled.
pub(crate) async fn drive(
    store: &mut Store<AsyncifyContext>,
    export: &WrappedExport,
    args: &[Val],
    segment_ticks: Option<u64>,
) -> Result<Vec<Val>, RuntimeError> {
    let (ops, data_addr) = {
        let controller = store.data().controller()?;
        (controller.ops(), controller.data_addr())
    };

    ops.assert_idle(&mut *store, "export call").map_err(classify)?;
    if !store.data().controller()?.pending().is_empty() {
        return Err(ProtocolStateError::StaleSuspension.into());
    }

    let mut results = export.result_buffer();
    run_segment(store, export, args, &mut results, segment_ticks)?;

    while unwinding(store, &ops)? {
        if let Err(err) = ops.stop_unwind(&mut *store) {
            reset(store);
            return Err(classify(err));
        }

        let future = match store.data_mut().controller_mut()?.pending.begin_settle() {
            Ok(future) => future,
            Err(err) => {
                reset(store);
                return Err(err.into());
            }
        };

        debug!(export = export.name(), "Awaiting suspended host value");
        let started = Instant::now();
        let settled = future.await;
        store.data_mut().metrics.suspended += started.elapsed();

        let values = match settled {
            Ok(values) => values,
            Err(err) => {
                warn!(export = export.name(), error = %err, "Suspended host value failed");
                reset(store);
                return Err(err.into());
            }
        };
        store.data_mut().controller_mut()?.pending.resolve(values);

        if let Err(err) = ops.assert_idle(&mut *store, "rewind") {
            reset(store);
            return Err(classify(err));
        }
        if let Err(err) = ops.start_rewind(&mut *store, data_addr) {
            reset(store);
            return Err(classify(err));
        }
        store.data_mut().metrics.rewinds += 1;
        debug!(export = export.name(), data_addr, "Rewinding");

        run_segment(store, export, args, &mut results, segment_ticks)?;
    }

    if let Err(err) = ops.assert_idle(&mut *store, "export return") {
        reset(store);
        return Err(classify(err));
    }
    if !store.data().controller()?.pending().is_empty() {
        reset(store);
        return Err(ProtocolStateError::UnconsumedValue.into());
    }

    store.data_mut().metrics.calls += 1;
    Ok(results)
}

fn unwinding(store: &mut Store<AsyncifyContext>, ops: &ControlOps) -> Result<bool, RuntimeError> {
    match ops.state(&mut *store) {
        Ok(state) => Ok(state == ExecutionState::Unwinding),
        Err(err) => {
            reset(store);
            Err(classify(err))
        }
    }
}

fn run_segment(
    store: &mut Store<AsyncifyContext>,
    export: &WrappedExport,
    args: &[Val],
    results: &mut [Val],
    segment_ticks: Option<u64>,
) -> Result<(), RuntimeError> {
    if let Some(ticks) = segment_ticks {
        store.set_epoch_deadline(ticks);
    }

    if let Err(err) = export.inner.func.call(&mut *store, args, results) {
        let err = classify(err);
        reset(store);
        return Err(err);
    }
    Ok(())
}

/// Best-effort return to idle; the original error is what the caller sees.
fn reset(store: &mut Store<AsyncifyContext>) {
    if let Err(err) = recover(store) {
        warn!(error = %err, "Failed to reset instance after error");
    }
}
