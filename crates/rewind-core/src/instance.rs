//! Instance wiring and the async call surface.
//!
//! [`AsyncInstance::new`] performs the whole setup for one instrumented
//! module:
//!
//! 1. Wrap every imported function with the import interceptor
//! 2. Instantiate the module with a fresh store
//! 3. Resolve the control exports, memory and save-area descriptor
//! 4. Install the [`Controller`] in the store data
//! 5. Wrap every non-reserved exported function, once per function index

use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use wasmtime::{Instance, Linker, Store, Val};

use crate::context::{
    AsyncifyContext, ExecutionMetrics, LogEntry, calculate_fuel_consumed, create_store,
    get_remaining_fuel,
};
use crate::controller::{ControlOps, Controller, classify, recover};
use crate::descriptor::{self, SaveAreaDescriptor};
use crate::exports::{self, ExportRegistry, WrappedExport};
use crate::imports::{ImportMap, ImportRegistry, link_imports};
use crate::{CompiledModule, WasmEngine};
use rewind_common::{ExecutionState, RuntimeConfig, RuntimeError};

/// An instantiated Asyncify module whose exports can be awaited.
///
/// Calls take `&mut self`, so at most one logical export call is in flight
/// per instance. Different instances are fully independent.
///
/// # Example
///
/// ```ignore
/// let mut instance = AsyncInstance::new(&engine, &module, &imports, &config)?;
/// let results = instance.call("main", &[Val::I32(5)]).await?;
/// ```
pub struct AsyncInstance {
    id: Uuid,
    store: Store<AsyncifyContext>,
    instance: Instance,
    exports: ExportRegistry,
    imports: ImportRegistry,
    segment_ticks: Option<u64>,
}

impl AsyncInstance {
    /// Instantiate `module` and wire it for suspension.
    ///
    /// # Errors
    ///
    /// Returns an error if an import is not provided, instantiation fails,
    /// or the module lacks the control exports or memory.
    #[instrument(skip_all, fields(content_hash = %module.content_hash()))]
    pub fn new(
        engine: &WasmEngine,
        module: &CompiledModule,
        imports: &ImportMap,
        config: &RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        config.asyncify.validate()?;

        let id = Uuid::new_v4();
        let mut store = create_store(engine, &config.execution, id.to_string())?;

        let mut linker = Linker::new(engine.inner());
        linker.allow_shadowing(true);
        let mut import_registry = ImportRegistry::default();
        link_imports(
            &mut linker,
            &mut store,
            module.inner(),
            imports,
            &mut import_registry,
        )?;

        debug!(instance_id = %id, "Instantiating module");
        let instance = linker
            .instantiate(&mut store, module.inner())
            .map_err(|e| match classify(e) {
                RuntimeError::Trap { message } => RuntimeError::instantiation(message),
                other => other,
            })?;

        let ops = ControlOps::resolve(&instance, &mut store, &config.asyncify)?;
        let memory = instance
            .get_memory(&mut store, &config.asyncify.memory_export)
            .ok_or_else(|| RuntimeError::MissingMemory {
                name: config.asyncify.memory_export.clone(),
            })?;
        let save_area = descriptor::resolve(&instance, &mut store, memory, &config.asyncify)?;

        store
            .data_mut()
            .install(Controller::new(ops, memory, save_area));

        let funcs: Vec<_> = instance
            .exports(&mut store)
            .filter_map(|export| {
                let name = export.name().to_string();
                export.into_func().map(|func| (name, func))
            })
            .collect();

        let mut exports = ExportRegistry::default();
        for (name, func) in funcs {
            if config.asyncify.is_reserved(&name) {
                continue;
            }
            let ty = func.ty(&store);
            exports.wrap(&name, module.export_func_index(&name), func, ty);
        }

        info!(
            instance_id = %id,
            exports = exports.len(),
            wrapped_imports = import_registry.len(),
            data_addr = save_area.data_addr,
            seeding = ?save_area.seeding,
            "Instance wired"
        );

        Ok(Self {
            id,
            store,
            instance,
            exports,
            imports: import_registry,
            segment_ticks: engine
                .is_epoch_enabled()
                .then_some(config.execution.segment_timeout_ticks),
        })
    }

    /// Call an export by name.
    ///
    /// # Errors
    ///
    /// See [`call_export`](Self::call_export).
    pub async fn call(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>, RuntimeError> {
        let export = self
            .export(name)
            .ok_or_else(|| RuntimeError::export_not_found(name))?;
        self.call_export(&export, args).await
    }

    /// Run one logical call of `export`, awaiting every suspension its
    /// imports request, and return the final results.
    ///
    /// Dropping the returned future while it awaits a host value abandons
    /// the call; the next call then fails with
    /// [`StaleSuspension`](rewind_common::ProtocolStateError::StaleSuspension)
    /// until [`reset`](Self::reset) is called.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ProtocolState`] if the module is not idle or
    /// violates the protocol, [`RuntimeError::HostFunction`] if a host value
    /// fails, and [`RuntimeError::Trap`] or [`RuntimeError::FuelExhausted`]
    /// if guest code traps.
    #[instrument(skip(self, export, args), fields(instance_id = %self.id, export = %export.name()))]
    pub async fn call_export(
        &mut self,
        export: &WrappedExport,
        args: &[Val],
    ) -> Result<Vec<Val>, RuntimeError> {
        if !self.exports.owns(export) {
            return Err(RuntimeError::export_not_found(export.name()));
        }

        let start = Instant::now();
        let initial_fuel = get_remaining_fuel(&self.store).unwrap_or(0);

        let result = exports::drive(&mut self.store, export, args, self.segment_ticks).await;

        let fuel_consumed = calculate_fuel_consumed(initial_fuel, &self.store);
        self.store.data_mut().metrics.fuel_consumed += fuel_consumed;
        let duration = start.elapsed();

        match &result {
            Ok(_) => info!(
                duration_ms = duration.as_millis(),
                fuel_consumed,
                "Export call completed"
            ),
            Err(RuntimeError::FuelExhausted) => warn!(
                duration_ms = duration.as_millis(),
                fuel_consumed,
                "Export call terminated: fuel exhausted"
            ),
            Err(err) => error!(
                duration_ms = duration.as_millis(),
                error = %err,
                "Export call failed"
            ),
        }

        result
    }

    /// The async wrapper for an export; the same wrapper on every request.
    ///
    /// Returns `None` for unknown exports and for reserved control exports.
    pub fn export(&self, name: &str) -> Option<WrappedExport> {
        self.exports.get(name)
    }

    /// Names of all wrapped exports, sorted.
    pub fn export_names(&self) -> Vec<String> {
        self.exports.names().map(str::to_string).collect()
    }

    /// Read the module's execution state.
    ///
    /// # Errors
    ///
    /// Returns an error if `get_state` traps or reports an unknown value.
    pub fn state(&mut self) -> Result<ExecutionState, RuntimeError> {
        let ops = self.ops()?;
        ops.state(&mut self.store).map_err(classify)
    }

    /// Raw `start_unwind`, at `data_addr` or the resolved descriptor address.
    ///
    /// # Errors
    ///
    /// Returns an error if the control export traps.
    pub fn start_unwind(&mut self, data_addr: Option<u32>) -> Result<(), RuntimeError> {
        let addr = data_addr.unwrap_or(self.data_addr()?);
        let ops = self.ops()?;
        ops.start_unwind(&mut self.store, addr).map_err(classify)
    }

    /// Raw `stop_unwind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the control export traps.
    pub fn stop_unwind(&mut self) -> Result<(), RuntimeError> {
        let ops = self.ops()?;
        ops.stop_unwind(&mut self.store).map_err(classify)
    }

    /// Raw `start_rewind`, at `data_addr` or the resolved descriptor address.
    ///
    /// # Errors
    ///
    /// Returns an error if the control export traps.
    pub fn start_rewind(&mut self, data_addr: Option<u32>) -> Result<(), RuntimeError> {
        let addr = data_addr.unwrap_or(self.data_addr()?);
        let ops = self.ops()?;
        ops.start_rewind(&mut self.store, addr).map_err(classify)
    }

    /// Raw `stop_rewind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the control export traps.
    pub fn stop_rewind(&mut self) -> Result<(), RuntimeError> {
        let ops = self.ops()?;
        ops.stop_rewind(&mut self.store).map_err(classify)
    }

    /// Return to idle after an abandoned call or forced state.
    ///
    /// # Errors
    ///
    /// Returns an error if the control exports trap or the descriptor
    /// cannot be written.
    pub fn reset(&mut self) -> Result<(), RuntimeError> {
        recover(&mut self.store)
    }

    /// Address of the save-area descriptor.
    ///
    /// # Errors
    ///
    /// Fails only if the instance was never wired.
    pub fn data_addr(&self) -> Result<u32, RuntimeError> {
        Ok(self.store.data().controller()?.data_addr())
    }

    /// Current contents of the save-area descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be read.
    pub fn descriptor(&self) -> Result<SaveAreaDescriptor, RuntimeError> {
        let controller = self.store.data().controller()?;
        SaveAreaDescriptor::read(controller.memory(), &self.store, controller.data_addr())
    }

    /// Copy `len` bytes of linear memory starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Memory`] if the range is out of bounds.
    pub fn read_memory(&self, offset: u32, len: usize) -> Result<Vec<u8>, RuntimeError> {
        let memory = self.store.data().controller()?.memory();
        let mut buf = vec![0u8; len];
        memory
            .read(&self.store, offset as usize, &mut buf)
            .map_err(|e| RuntimeError::memory(offset, e.to_string()))?;
        Ok(buf)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.store.data().metrics
    }

    /// Logs written by the guest through `env.log`.
    pub fn logs(&self) -> &[LogEntry] {
        &self.store.data().logs
    }

    /// Number of distinct import wrappers created for this instance.
    pub fn wrapped_import_count(&self) -> usize {
        self.imports.len()
    }

    /// The underlying wasmtime instance.
    pub fn inner(&self) -> &Instance {
        &self.instance
    }

    fn ops(&self) -> Result<ControlOps, RuntimeError> {
        Ok(self.store.data().controller()?.ops())
    }
}

impl std::fmt::Debug for AsyncInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncInstance")
            .field("id", &self.id)
            .field("exports", &self.exports.len())
            .field("wrapped_imports", &self.imports.len())
            .finish_non_exhaustive()
    }
}
