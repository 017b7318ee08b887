//! Execution state controller.
//!
//! The [`Controller`] owns everything the two interceptors share for one
//! instance: the typed control exports, the save-area address and stack
//! hook, and the single [`PendingValue`] slot that carries a host value from
//! the unwind that produced it to the replay that consumes it.

use tracing::{debug, warn};
use wasmtime::{AsContextMut, Instance, Memory, Store, Trap, TypedFunc, Val};

use crate::context::AsyncifyContext;
use crate::descriptor::{SaveArea, SaveAreaDescriptor, StackHook, addr_to_i32};
use crate::imports::HostFuture;
use rewind_common::{
    AsyncifyConfig, ExecutionState, HostFunctionError, ProtocolStateError, RuntimeError,
};

/// Control operations every instrumented module must export, without prefix.
pub const CONTROL_OPERATIONS: [&str; 5] = [
    "get_state",
    "start_unwind",
    "stop_unwind",
    "start_rewind",
    "stop_rewind",
];

/// Typed handles to the Asyncify control exports.
///
/// These are direct pass-through calls into the module; they are never
/// wrapped or intercepted.
#[derive(Clone)]
pub struct ControlOps {
    get_state: TypedFunc<(), i32>,
    start_unwind: TypedFunc<i32, ()>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
}

impl ControlOps {
    /// Look up all five control exports on an instance.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::MissingControlExport`] naming the first export
    /// that is absent or has the wrong signature.
    pub fn resolve(
        instance: &Instance,
        mut store: impl AsContextMut,
        config: &AsyncifyConfig,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            get_state: typed(instance, &mut store, config, "get_state")?,
            start_unwind: typed(instance, &mut store, config, "start_unwind")?,
            stop_unwind: typed(instance, &mut store, config, "stop_unwind")?,
            start_rewind: typed(instance, &mut store, config, "start_rewind")?,
            stop_rewind: typed(instance, &mut store, config, "stop_rewind")?,
        })
    }

    /// Read the module's current execution state.
    pub fn state(&self, store: impl AsContextMut) -> wasmtime::Result<ExecutionState> {
        let raw = self.get_state.call(store, ())?;
        Ok(ExecutionState::try_from(raw)?)
    }

    /// Fail with [`ProtocolStateError`] unless the state is `None`.
    pub fn assert_idle(
        &self,
        store: impl AsContextMut,
        operation: &'static str,
    ) -> wasmtime::Result<()> {
        self.state(store)?.expect(ExecutionState::None, operation)?;
        Ok(())
    }

    pub fn start_unwind(&self, store: impl AsContextMut, data_addr: u32) -> wasmtime::Result<()> {
        self.start_unwind.call(store, addr_to_i32(data_addr))
    }

    pub fn stop_unwind(&self, store: impl AsContextMut) -> wasmtime::Result<()> {
        self.stop_unwind.call(store, ())
    }

    pub fn start_rewind(&self, store: impl AsContextMut, data_addr: u32) -> wasmtime::Result<()> {
        self.start_rewind.call(store, addr_to_i32(data_addr))
    }

    pub fn stop_rewind(&self, store: impl AsContextMut) -> wasmtime::Result<()> {
        self.stop_rewind.call(store, ())
    }
}

fn typed<P, R>(
    instance: &Instance,
    store: impl AsContextMut,
    config: &AsyncifyConfig,
    operation: &str,
) -> Result<TypedFunc<P, R>, RuntimeError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let name = config.control_export(operation);
    instance
        .get_typed_func::<P, R>(store, &name)
        .map_err(|_| RuntimeError::missing_control_export(name))
}

/// Single-slot holder for the value threaded from an unwind to its replay.
#[derive(Default)]
pub enum PendingValue {
    /// No suspension in flight.
    #[default]
    Empty,
    /// An import returned this future and the module is unwinding.
    Suspended(HostFuture),
    /// The export interceptor took the future and is awaiting it.
    Settling,
    /// The future settled; the replayed import will consume this.
    Resolved(Vec<Val>),
}

impl PendingValue {
    /// Returns `true` if no suspension is in flight.
    pub fn is_empty(&self) -> bool {
        matches!(self, PendingValue::Empty)
    }

    pub(crate) fn suspend(&mut self, future: HostFuture) -> Result<(), ProtocolStateError> {
        if !self.is_empty() {
            return Err(ProtocolStateError::PendingOccupied);
        }
        *self = PendingValue::Suspended(future);
        Ok(())
    }

    pub(crate) fn begin_settle(&mut self) -> Result<HostFuture, ProtocolStateError> {
        match std::mem::replace(self, PendingValue::Settling) {
            PendingValue::Suspended(future) => Ok(future),
            other => {
                *self = other;
                Err(ProtocolStateError::MissingPendingValue)
            }
        }
    }

    pub(crate) fn resolve(&mut self, values: Vec<Val>) {
        *self = PendingValue::Resolved(values);
    }

    pub(crate) fn take_resolved(&mut self) -> Result<Vec<Val>, ProtocolStateError> {
        match std::mem::take(self) {
            PendingValue::Resolved(values) => Ok(values),
            other => {
                *self = other;
                Err(ProtocolStateError::MissingResolvedValue)
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = PendingValue::Empty;
    }
}

impl std::fmt::Debug for PendingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingValue::Empty => write!(f, "Empty"),
            PendingValue::Suspended(_) => write!(f, "Suspended"),
            PendingValue::Settling => write!(f, "Settling"),
            PendingValue::Resolved(values) => write!(f, "Resolved({} values)", values.len()),
        }
    }
}

/// Instance-scoped suspend/resume state.
///
/// Created once at instantiation, stored in the instance's
/// [`AsyncifyContext`], and dropped together with the store.
pub struct Controller {
    ops: ControlOps,
    memory: Memory,
    save_area: SaveArea,
    pub(crate) pending: PendingValue,
}

impl Controller {
    pub(crate) fn new(ops: ControlOps, memory: Memory, save_area: SaveArea) -> Self {
        Self {
            ops,
            memory,
            save_area,
            pending: PendingValue::Empty,
        }
    }

    pub fn ops(&self) -> ControlOps {
        self.ops.clone()
    }

    /// Address of the save-area descriptor.
    pub fn data_addr(&self) -> u32 {
        self.save_area.data_addr
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Hook refreshing the descriptor end before each unwind, if registered.
    pub fn stack_hook(&self) -> Option<StackHook> {
        self.save_area.stack_hook
    }

    pub fn save_area(&self) -> &SaveArea {
        &self.save_area
    }

    pub fn pending(&self) -> &PendingValue {
        &self.pending
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("save_area", &self.save_area)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Return an instance to `None` after a call failed mid-cycle.
///
/// Stops any active unwind or rewind, drops the pending value, and restores
/// the descriptor's start word so discarded frames do not consume the save
/// area.
pub(crate) fn recover(store: &mut Store<AsyncifyContext>) -> Result<(), RuntimeError> {
    let (ops, memory, data_addr, baseline) = {
        let controller = store.data().controller()?;
        (
            controller.ops(),
            controller.memory(),
            controller.data_addr(),
            controller.save_area().descriptor,
        )
    };

    let state = ops.state(&mut *store).map_err(classify)?;
    match state {
        ExecutionState::Unwinding => ops.stop_unwind(&mut *store).map_err(classify)?,
        ExecutionState::Rewinding => ops.stop_rewind(&mut *store).map_err(classify)?,
        ExecutionState::None => {}
    }

    store.data_mut().controller_mut()?.pending.clear();
    SaveAreaDescriptor::write_start(memory, &mut *store, data_addr, baseline.start)?;

    debug!(
        previous_state = %state,
        start = baseline.start,
        "Instance reset to idle"
    );
    Ok(())
}

/// Map an error raised by guest code or a wrapped import to a [`RuntimeError`].
///
/// Errors raised inside host callbacks cross wasmtime as `wasmtime::Error`;
/// the original typed error is recovered by downcasting.
pub(crate) fn classify(err: wasmtime::Error) -> RuntimeError {
    let err = match err.downcast::<ProtocolStateError>() {
        Ok(protocol) => return protocol.into(),
        Err(err) => err,
    };
    let err = match err.downcast::<HostFunctionError>() {
        Ok(host) => return host.into(),
        Err(err) => err,
    };
    let err = match err.downcast::<RuntimeError>() {
        Ok(runtime) => return runtime,
        Err(err) => err,
    };

    if err
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
    {
        return RuntimeError::FuelExhausted;
    }

    warn!(error = %err, "Guest trapped");
    RuntimeError::trap(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_future(value: i32) -> HostFuture {
        Box::pin(async move { Ok(vec![Val::I32(value)]) })
    }

    #[test]
    fn test_pending_value_cycle() {
        let mut slot = PendingValue::default();
        assert!(slot.is_empty());

        slot.suspend(ready_future(7)).unwrap();
        assert!(!slot.is_empty());

        let future = slot.begin_settle().unwrap();
        assert!(matches!(slot, PendingValue::Settling));

        let values = tokio_test::block_on(future).unwrap();
        slot.resolve(values);

        let values = slot.take_resolved().unwrap();
        assert_eq!(values[0].unwrap_i32(), 7);
        assert!(slot.is_empty());
    }

    #[test]
    fn test_pending_value_rejects_second_suspension() {
        let mut slot = PendingValue::default();
        slot.suspend(ready_future(1)).unwrap();

        assert_eq!(
            slot.suspend(ready_future(2)).unwrap_err(),
            ProtocolStateError::PendingOccupied
        );
    }

    #[test]
    fn test_pending_value_out_of_order() {
        let mut slot = PendingValue::default();
        assert_eq!(
            slot.begin_settle().err(),
            Some(ProtocolStateError::MissingPendingValue)
        );
        assert_eq!(
            slot.take_resolved().unwrap_err(),
            ProtocolStateError::MissingResolvedValue
        );

        slot.suspend(ready_future(3)).unwrap();
        assert_eq!(
            slot.take_resolved().unwrap_err(),
            ProtocolStateError::MissingResolvedValue
        );
        // A failed take leaves the suspension in place.
        assert!(matches!(slot, PendingValue::Suspended(_)));

        slot.clear();
        assert!(slot.is_empty());
    }

    #[test]
    fn test_pending_value_debug() {
        let mut slot = PendingValue::default();
        assert_eq!(format!("{slot:?}"), "Empty");

        slot.resolve(vec![Val::I32(1), Val::I64(2)]);
        assert_eq!(format!("{slot:?}"), "Resolved(2 values)");
    }

    #[test]
    fn test_classify_typed_errors() {
        let err = wasmtime::Error::new(ProtocolStateError::StaleSuspension);
        assert!(matches!(
            classify(err),
            RuntimeError::ProtocolState(ProtocolStateError::StaleSuspension)
        ));

        let err = wasmtime::Error::new(HostFunctionError::invalid_argument("negative"));
        assert!(matches!(classify(err), RuntimeError::HostFunction(_)));

        let err = wasmtime::Error::new(Trap::OutOfFuel);
        assert!(matches!(classify(err), RuntimeError::FuelExhausted));

        let err = wasmtime::Error::msg("boom");
        assert!(matches!(classify(err), RuntimeError::Trap { .. }));
    }
}
