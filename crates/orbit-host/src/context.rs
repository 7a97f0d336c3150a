//! Guest memory seen through a Wasmtime caller.
//!
//! Host functions installed by [`bind`](crate::ExtensionProcess::bind) receive
//! the Wasmtime `Caller` of the guest instance that invoked them. Wrapping it
//! in a [`CallerMemory`] lets the memory bridge serve that instance's
//! `memory` export while the call is outstanding.

use wasmtime::{Caller, Memory};

use crate::error::{BridgeError, BridgeResult};
use crate::memory::GuestMemory;

/// Linear memory of the guest instance behind a Wasmtime caller.
pub struct CallerMemory<'a, T> {
    /// The Wasmtime caller.
    caller: Caller<'a, T>,
    /// The default memory export, if the guest has one.
    memory: Option<Memory>,
}

impl<'a, T> CallerMemory<'a, T> {
    /// Wrap a caller, resolving its default memory export.
    pub fn new(mut caller: Caller<'a, T>) -> Self {
        let memory = caller.get_export("memory").and_then(|e| e.into_memory());
        Self { caller, memory }
    }

    /// Whether the guest exports a memory.
    pub fn has_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// Get a reference to the underlying Wasmtime caller.
    pub fn caller(&self) -> &Caller<'a, T> {
        &self.caller
    }

    /// Get a mutable reference to the underlying Wasmtime caller.
    pub fn caller_mut(&mut self) -> &mut Caller<'a, T> {
        &mut self.caller
    }

    fn memory(&self) -> BridgeResult<Memory> {
        self.memory.ok_or(BridgeError::MemoryNotFound)
    }
}

impl<T> GuestMemory for CallerMemory<'_, T> {
    fn len(&self) -> usize {
        self.memory
            .map(|memory| memory.data_size(&self.caller))
            .unwrap_or(0)
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> BridgeResult<()> {
        let memory = self.memory()?;
        memory
            .read(&self.caller, offset, buf)
            .map_err(|_| BridgeError::MemoryAccessOutOfBounds {
                offset,
                len: buf.len(),
                memory_size: memory.data_size(&self.caller),
            })
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> BridgeResult<()> {
        let memory = self.memory()?;
        memory
            .write(&mut self.caller, offset, data)
            .map_err(|_| BridgeError::MemoryAccessOutOfBounds {
                offset,
                len: data.len(),
                memory_size: memory.data_size(&self.caller),
            })
    }
}

impl<T> std::fmt::Debug for CallerMemory<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerMemory")
            .field("has_memory", &self.memory.is_some())
            .field("len", &self.len())
            .finish()
    }
}
