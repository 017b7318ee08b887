//! Save-area descriptor resolution.
//!
//! Asyncify keeps a two-word descriptor in linear memory: the current write
//! position and the end of the region where unwound frames are stored. This
//! module finds the descriptor address, seeds it when the module left it
//! zeroed, and registers a hook that keeps the end aligned with the live
//! stack pointer.

use tracing::debug;
use wasmtime::{AsContext, AsContextMut, Extern, Global, Instance, Memory};

use rewind_common::{AsyncifyConfig, DESCRIPTOR_SIZE, RuntimeError};

/// The two words at the descriptor address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveAreaDescriptor {
    /// Next free byte of the save area.
    pub start: u32,
    /// End of the save area (exclusive).
    pub end: u32,
}

impl SaveAreaDescriptor {
    /// Read the descriptor at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Memory`] if the descriptor lies outside memory.
    pub fn read(memory: Memory, store: impl AsContext, addr: u32) -> Result<Self, RuntimeError> {
        let mut buf = [0u8; DESCRIPTOR_SIZE as usize];
        memory
            .read(store, addr as usize, &mut buf)
            .map_err(|e| RuntimeError::memory(addr, e.to_string()))?;
        Ok(Self::from_bytes(buf))
    }

    /// Write both words at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Memory`] if the descriptor lies outside memory.
    pub fn write(
        &self,
        memory: Memory,
        store: impl AsContextMut,
        addr: u32,
    ) -> Result<(), RuntimeError> {
        memory
            .write(store, addr as usize, &self.to_bytes())
            .map_err(|e| RuntimeError::memory(addr, e.to_string()))
    }

    /// Overwrite only the start word.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Memory`] if the word lies outside memory.
    pub fn write_start(
        memory: Memory,
        store: impl AsContextMut,
        addr: u32,
        start: u32,
    ) -> Result<(), RuntimeError> {
        write_word(memory, store, addr, start)
    }

    /// Overwrite only the end word.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Memory`] if the word lies outside memory.
    pub fn write_end(
        memory: Memory,
        store: impl AsContextMut,
        addr: u32,
        end: u32,
    ) -> Result<(), RuntimeError> {
        write_word(memory, store, addr.saturating_add(4), end)
    }

    /// Both words zero: nothing has set up the save area yet.
    pub fn is_uninitialized(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    /// Bytes still available for unwound frames.
    pub fn capacity(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE as usize] {
        let mut buf = [0u8; DESCRIPTOR_SIZE as usize];
        buf[..4].copy_from_slice(&self.start.to_le_bytes());
        buf[4..].copy_from_slice(&self.end.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; DESCRIPTOR_SIZE as usize]) -> Self {
        Self {
            start: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            end: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

fn write_word(
    memory: Memory,
    store: impl AsContextMut,
    addr: u32,
    value: u32,
) -> Result<(), RuntimeError> {
    memory
        .write(store, addr as usize, &value.to_le_bytes())
        .map_err(|e| RuntimeError::memory(addr, e.to_string()))
}

/// Keeps the descriptor end equal to the live stack pointer.
///
/// Frames saved during an unwind must not overwrite the shadow stack, so the
/// end word is refreshed immediately before every `start_unwind`.
#[derive(Debug, Clone, Copy)]
pub struct StackHook {
    stack_pointer: Global,
}

impl StackHook {
    /// Write the current stack pointer into the descriptor end word.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack pointer is not an i32 global or the
    /// descriptor cannot be written.
    pub fn refresh(
        &self,
        memory: Memory,
        mut store: impl AsContextMut,
        data_addr: u32,
    ) -> Result<u32, RuntimeError> {
        let end = global_addr(self.stack_pointer, &mut store, "stack pointer")?;
        SaveAreaDescriptor::write_end(memory, &mut store, data_addr, end)?;
        debug!(data_addr, end, "Save area end refreshed from stack pointer");
        Ok(end)
    }
}

/// How the descriptor got its initial contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seeding {
    /// The module initialized it; left untouched.
    Existing,
    /// Seeded from the low-stack mark and the stack pointer.
    StackSymbols,
    /// Seeded with the configured defaults.
    Defaults,
}

/// The resolved save area of one instance.
#[derive(Debug, Clone, Copy)]
pub struct SaveArea {
    /// Address of the descriptor in linear memory.
    pub data_addr: u32,
    /// Descriptor contents right after resolution.
    pub descriptor: SaveAreaDescriptor,
    pub stack_hook: Option<StackHook>,
    pub seeding: Seeding,
}

/// Find the descriptor address.
///
/// Uses the explicit data address export when present, either as a global
/// or as a nullary function returning i32, and the configured default
/// otherwise.
///
/// # Errors
///
/// Returns an error if the export exists but is not an i32 global or
/// `() -> i32` function, or if calling it traps.
pub fn resolve_data_addr(
    instance: &Instance,
    mut store: impl AsContextMut,
    config: &AsyncifyConfig,
) -> Result<u32, RuntimeError> {
    let name = &config.data_addr_export;
    match instance.get_export(&mut store, name) {
        Some(Extern::Global(global)) => global_addr(global, &mut store, name),
        Some(Extern::Func(func)) => {
            let func = func.typed::<(), i32>(&store).map_err(|e| {
                RuntimeError::invalid_config(format!("{name} must have type () -> i32: {e}"))
            })?;
            let raw = func
                .call(&mut store, ())
                .map_err(|e| RuntimeError::trap(format!("{name} trapped: {e}")))?;
            Ok(addr_from_i32(raw))
        }
        Some(_) => Err(RuntimeError::invalid_config(format!(
            "{name} must be a global or a function"
        ))),
        None => Ok(config.default_data_addr),
    }
}

/// Resolve the descriptor address and seed the descriptor if it is zeroed.
///
/// # Errors
///
/// Returns an error if the address cannot be resolved or the descriptor
/// lies outside memory.
pub fn resolve(
    instance: &Instance,
    mut store: impl AsContextMut,
    memory: Memory,
    config: &AsyncifyConfig,
) -> Result<SaveArea, RuntimeError> {
    let data_addr = resolve_data_addr(instance, &mut store, config)?;

    let existing = SaveAreaDescriptor::read(memory, &store, data_addr)?;
    if !existing.is_uninitialized() {
        debug!(
            data_addr,
            start = existing.start,
            end = existing.end,
            "Save area already initialized"
        );
        return Ok(SaveArea {
            data_addr,
            descriptor: existing,
            stack_hook: None,
            seeding: Seeding::Existing,
        });
    }

    let stack_low = instance.get_global(&mut store, &config.stack_low_export);
    let stack_pointer = instance.get_global(&mut store, &config.stack_pointer_export);

    let (descriptor, stack_hook, seeding) = match (stack_low, stack_pointer) {
        (Some(low), Some(pointer)) => {
            let start = global_addr(low, &mut store, &config.stack_low_export)?;
            let end = global_addr(pointer, &mut store, &config.stack_pointer_export)?;
            (
                SaveAreaDescriptor { start, end },
                Some(StackHook {
                    stack_pointer: pointer,
                }),
                Seeding::StackSymbols,
            )
        }
        _ => (
            SaveAreaDescriptor {
                start: config.default_save_area_start(data_addr),
                end: config.default_save_area_end,
            },
            None,
            Seeding::Defaults,
        ),
    };

    descriptor.write(memory, &mut store, data_addr)?;
    debug!(
        data_addr,
        start = descriptor.start,
        end = descriptor.end,
        seeding = ?seeding,
        "Save area seeded"
    );

    Ok(SaveArea {
        data_addr,
        descriptor,
        stack_hook,
        seeding,
    })
}

fn global_addr(
    global: Global,
    store: impl AsContextMut,
    name: &str,
) -> Result<u32, RuntimeError> {
    global
        .get(store)
        .i32()
        .map(addr_from_i32)
        .ok_or_else(|| RuntimeError::invalid_config(format!("{name} must be an i32 global")))
}

/// Reinterpret a wasm i32 as a linear-memory address.
#[allow(clippy::cast_sign_loss)]
pub(crate) fn addr_from_i32(raw: i32) -> u32 {
    raw as u32
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn addr_to_i32(addr: u32) -> i32 {
    addr as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        let descriptor = SaveAreaDescriptor {
            start: 24,
            end: 1024,
        };
        let bytes = descriptor.to_bytes();

        assert_eq!(&bytes[..4], &24u32.to_le_bytes());
        assert_eq!(&bytes[4..], &1024u32.to_le_bytes());
        assert_eq!(SaveAreaDescriptor::from_bytes(bytes), descriptor);
        assert_eq!(descriptor.capacity(), 1000);
    }

    #[test]
    fn test_uninitialized() {
        assert!(SaveAreaDescriptor::default().is_uninitialized());
        assert!(!SaveAreaDescriptor { start: 0, end: 8 }.is_uninitialized());
        assert!(!SaveAreaDescriptor { start: 8, end: 0 }.is_uninitialized());
    }

    #[test]
    fn test_capacity_saturates() {
        let exhausted = SaveAreaDescriptor {
            start: 2048,
            end: 1024,
        };
        assert_eq!(exhausted.capacity(), 0);
    }

    #[test]
    fn test_address_reinterpretation() {
        assert_eq!(addr_from_i32(16), 16);
        assert_eq!(addr_from_i32(-1), u32::MAX);
        assert_eq!(addr_to_i32(u32::MAX), -1);
    }
}
