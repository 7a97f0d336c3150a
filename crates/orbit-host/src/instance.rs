//! Guest instances bound to an extension.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use orbit_core::{FunctionDefinition, InstanceId, Value};
use tracing::{debug, info};

use crate::dispatch::CallDispatcher;
use crate::error::{BridgeError, BridgeResult};
use crate::memory::GuestMemory;
use crate::process::ExtensionInner;

/// State shared between a [`BoundInstance`] and the host functions it
/// registered.
pub(crate) struct InstanceShared {
    pub(crate) id: InstanceId,
    pub(crate) module: String,
    /// Exactly the functions registered at bind time.
    pub(crate) definitions: Vec<FunctionDefinition>,
    pub(crate) extension: Weak<ExtensionInner>,
    closed: AtomicBool,
    invalidated: AtomicBool,
}

impl InstanceShared {
    pub(crate) fn new(
        id: InstanceId,
        module: String,
        definitions: Vec<FunctionDefinition>,
        extension: Weak<ExtensionInner>,
    ) -> Self {
        Self {
            id,
            module,
            definitions,
            extension,
            closed: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Returns whether this call did the closing.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One guest instance's binding to an extension.
///
/// Created by [`ExtensionProcess::bind`](crate::ExtensionProcess::bind).
/// The functions it registered keep working until the instance is closed,
/// dropped, or invalidated by a reload that changed their signatures.
pub struct BoundInstance {
    shared: Arc<InstanceShared>,
}

impl BoundInstance {
    pub(crate) fn new(shared: Arc<InstanceShared>) -> Self {
        Self { shared }
    }

    /// The instance id, as seen by the extension.
    pub fn id(&self) -> InstanceId {
        self.shared.id
    }

    /// The import module the functions were registered under.
    pub fn module(&self) -> &str {
        &self.shared.module
    }

    /// The functions registered for this instance.
    pub fn functions(&self) -> &[FunctionDefinition] {
        &self.shared.definitions
    }

    /// Whether the instance was closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Whether a reload invalidated the instance.
    pub fn is_invalidated(&self) -> bool {
        self.shared.is_invalidated()
    }

    /// Call a bound function directly, against `memory`.
    ///
    /// This is the same path a guest takes through its registered host
    /// function.
    pub fn call(
        &self,
        name: &str,
        memory: &mut dyn GuestMemory,
        args: &[Value],
    ) -> BridgeResult<Vec<Value>> {
        let definition = self
            .shared
            .definitions
            .iter()
            .find(|def| def.name == name)
            .ok_or_else(|| BridgeError::FunctionNotExported(name.to_string()))?;
        CallDispatcher::new(Arc::clone(&self.shared), definition.clone())
            .dispatch(memory, args)
    }

    /// Close the instance and release its state in the extension.
    ///
    /// Waits for in-flight calls on the extension. Closing twice is a no-op.
    pub fn close(&self) {
        if !self.shared.mark_closed() {
            return;
        }

        let Some(extension) = self.shared.extension.upgrade() else {
            return;
        };
        let mut state = extension.state.write();
        state.instances.remove(&self.shared.id);
        if let Some(connection) = state.connection.as_ref() {
            if let Err(e) = extension.release(connection, self.shared.id) {
                debug!(instance = %self.shared.id, error = %e, "Release failed");
            }
        }
        info!(extension = %extension.label(), instance = %self.shared.id, "Instance closed");
    }
}

impl Drop for BoundInstance {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BoundInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundInstance")
            .field("id", &self.shared.id)
            .field("module", &self.shared.module)
            .field("functions", &self.shared.definitions.len())
            .field("closed", &self.shared.is_closed())
            .field("invalidated", &self.shared.is_invalidated())
            .finish()
    }
}
