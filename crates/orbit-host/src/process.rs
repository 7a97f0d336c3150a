//! Loaded extensions.
//!
//! An [`ExtensionProcess`] owns one extension binary: its working copy, the
//! running child, the cached symbol table and every guest instance bound to
//! it. All of that sits behind one reader/writer lock. Calls hold it for
//! reading; binding, reloading, reconnecting and closing hold it for writing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::Receiver;
use orbit_core::{InstanceId, Request, Response};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::binary::{self, WorkingCopy};
use crate::config::BridgeConfig;
use crate::dispatch::CallDispatcher;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{EventChannel, ExtensionEvent};
use crate::instance::{BoundInstance, InstanceShared};
use crate::link::Connection;
use crate::registry::FunctionRegistry;
use crate::symbols::{SymbolTable, fetch_meta, unexpected};
use crate::watcher::WatcherHandle;

/// Everything guarded by the extension's lock.
pub(crate) struct ProcessState {
    pub(crate) connection: Option<Connection>,
    pub(crate) symbols: Option<SymbolTable>,
    pub(crate) name: Option<String>,
    pub(crate) instances: HashMap<InstanceId, Arc<InstanceShared>>,
    pub(crate) content_hash: String,
}

pub(crate) struct ExtensionInner {
    pub(crate) origin: PathBuf,
    pub(crate) config: BridgeConfig,
    working: WorkingCopy,
    pub(crate) state: RwLock<ProcessState>,
    pub(crate) events: EventChannel,
    closed: AtomicBool,
    watcher: Mutex<Option<WatcherHandle>>,
    next_instance: AtomicU64,
}

impl ExtensionInner {
    pub(crate) fn label(&self) -> String {
        self.origin
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.origin.display().to_string())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Timeout for control requests, which never run guest code.
    fn control_timeout(&self) -> Option<Duration> {
        Some(self.config.handshake_timeout)
    }

    pub(crate) fn release(&self, connection: &Connection, instance: InstanceId) -> BridgeResult<()> {
        self.control(connection, Request::Release { instance })
    }

    fn attach(&self, connection: &Connection, instance: InstanceId) -> BridgeResult<()> {
        self.control(connection, Request::Attach { instance })
    }

    fn control(&self, connection: &Connection, request: Request) -> BridgeResult<()> {
        let label = format!("{request:?}");
        match connection.link().request(request, self.control_timeout())? {
            Response::Ack => Ok(()),
            other => Err(unexpected(&label, &other)),
        }
    }

    /// Fetch symbols and metadata unless both are cached.
    fn ensure_symbols<'a>(&self, state: &'a mut ProcessState) -> BridgeResult<&'a SymbolTable> {
        if state.symbols.is_none() || state.name.is_none() {
            let connection = state.connection.as_ref().ok_or_else(|| self.not_connected())?;
            let symbols = SymbolTable::fetch(connection.link(), self.control_timeout())?;
            let meta = fetch_meta(connection.link(), self.control_timeout())?;
            debug!(extension = %self.label(), name = %meta.name, functions = symbols.len(), "Fetched symbols");
            state.name.get_or_insert(meta.name);
            state.symbols = Some(symbols);
        }
        state.symbols.as_ref().ok_or_else(|| self.not_connected())
    }

    fn not_connected(&self) -> BridgeError {
        BridgeError::ExtensionUnreachable(format!("{}: not connected", self.label()))
    }

    /// Replace the child and re-attach every instance.
    ///
    /// Runs the per-instance cleanup against the old child, reconnects on
    /// the working copy, then re-attaches instances whose functions are
    /// unchanged. Instances whose functions drifted are invalidated and
    /// returned as events, to be emitted once the lock is released.
    fn restart(&self, state: &mut ProcessState) -> BridgeResult<Vec<ExtensionEvent>> {
        if let Some(old) = state.connection.take() {
            for &id in state.instances.keys() {
                if let Err(e) = self.release(&old, id) {
                    debug!(extension = %self.label(), instance = %id, error = %e, "Cleanup failed");
                }
            }
            old.kill();
        }
        state.symbols = None;

        let connection = Connection::spawn(self.working.path(), &self.config)?;
        let symbols = SymbolTable::fetch(connection.link(), self.control_timeout())?;
        let meta = fetch_meta(connection.link(), self.control_timeout())?;
        state.name.get_or_insert(meta.name);

        // Nothing is invalidated until every surviving instance is attached.
        let (unchanged, drifted) = symbols.split_by_drift(
            state
                .instances
                .values()
                .map(|instance| (instance.id, instance.definitions.as_slice())),
        );
        for id in unchanged {
            self.attach(&connection, id)?;
        }

        let mut events = Vec::with_capacity(drifted.len());
        for (id, drift) in drifted {
            if let Some(instance) = state.instances.remove(&id) {
                instance.invalidate();
            }
            warn!(extension = %self.label(), instance = %id, functions = ?drift, "Instance invalidated by signature change");
            events.push(ExtensionEvent::InstanceInvalidated {
                instance: id,
                functions: drift,
            });
        }

        state.connection = Some(connection);
        state.symbols = Some(symbols);
        Ok(events)
    }

    /// Refresh the working copy from the watched binary and restart on it.
    pub(crate) fn reload(&self) -> BridgeResult<String> {
        let (hash, events) = {
            let mut state = self.state.write();
            if self.is_closed() {
                return Err(BridgeError::ExtensionClosed);
            }

            self.working.refresh(&self.origin)?;
            let hash = binary::hash_file(self.working.path())?;
            let events = self.restart(&mut state)?;

            if let Err(e) = binary::persist_hash(&self.origin, &hash) {
                warn!(path = %self.origin.display(), error = %e, "Failed to persist content hash");
            }
            state.content_hash = hash.clone();
            (hash, events)
        };

        info!(extension = %self.label(), %hash, "Extension reloaded");
        for event in events {
            self.events.emit(event);
        }
        self.events.emit(ExtensionEvent::Reloaded {
            path: self.origin.clone(),
            hash: hash.clone(),
        });
        Ok(hash)
    }

    pub(crate) fn content_hash(&self) -> String {
        self.state.read().content_hash.clone()
    }
}

/// Handle to a loaded extension.
///
/// Cloning the handle is cheap; every clone refers to the same child and
/// lock. The child is killed when the extension is closed or the last
/// handle is dropped.
///
/// # Example
///
/// ```ignore
/// use orbit_host::{ExtensionProcess, HostFunctions, LinearMemory};
/// use orbit_core::Value;
///
/// let extension = ExtensionProcess::load("./target/debug/my-extension")?;
/// let mut functions = HostFunctions::new();
/// let instance = extension.bind(&mut functions)?;
///
/// let mut memory = LinearMemory::new(1024);
/// let out = instance.call("add", &mut memory, &[Value::I32(5), Value::I32(3)])?;
/// assert_eq!(out, vec![Value::I32(8)]);
/// ```
#[derive(Clone)]
pub struct ExtensionProcess {
    inner: Arc<ExtensionInner>,
}

impl ExtensionProcess {
    /// Load the extension at `path` with the default configuration.
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        Self::load_with_config(path, BridgeConfig::default())
    }

    /// Load the extension at `path`.
    ///
    /// Copies the binary to a working location, spawns it, validates the
    /// handshake and, unless disabled, starts watching the binary.
    pub fn load_with_config(path: impl AsRef<Path>, config: BridgeConfig) -> BridgeResult<Self> {
        let origin = binary::resolve(path.as_ref())?;
        let working = WorkingCopy::create(&origin, config.working_dir.as_deref())?;
        working.refresh(&origin)?;

        let content_hash = binary::hash_file(working.path())?;
        match binary::read_persisted_hash(&origin) {
            Some(previous) if previous != content_hash => {
                debug!(path = %origin.display(), "Binary changed since it was last loaded");
            }
            _ => {}
        }
        binary::persist_hash(&origin, &content_hash)?;

        let connection = Connection::spawn(working.path(), &config)?;
        let pid = connection.pid();

        let inner = Arc::new(ExtensionInner {
            events: EventChannel::new(config.event_capacity),
            origin,
            working,
            state: RwLock::new(ProcessState {
                connection: Some(connection),
                symbols: None,
                name: None,
                instances: HashMap::new(),
                content_hash,
            }),
            closed: AtomicBool::new(false),
            watcher: Mutex::new(None),
            next_instance: AtomicU64::new(1),
            config,
        });

        if inner.config.watch {
            let handle = WatcherHandle::spawn(&inner)?;
            *inner.watcher.lock() = Some(handle);
        }

        info!(
            extension = %inner.label(),
            path = %inner.origin.display(),
            pid,
            watch = inner.config.watch,
            "Extension loaded"
        );
        Ok(Self { inner })
    }

    /// Path of the watched binary.
    pub fn path(&self) -> &Path {
        &self.inner.origin
    }

    /// Path of the running working copy.
    pub fn working_path(&self) -> &Path {
        self.inner.working.path()
    }

    /// The configuration the extension was loaded with.
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Content hash of the build currently running.
    pub fn content_hash(&self) -> String {
        self.inner.content_hash()
    }

    /// OS process id of the running child, if connected.
    pub fn pid(&self) -> Option<u32> {
        self.inner
            .state
            .read()
            .connection
            .as_ref()
            .map(Connection::pid)
    }

    /// Number of bound, open instances.
    pub fn instance_count(&self) -> usize {
        self.inner.state.read().instances.len()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// The extension's display name, fetched on first use.
    pub fn name(&self) -> BridgeResult<String> {
        if let Some(name) = self.inner.state.read().name.clone() {
            return Ok(name);
        }
        let mut state = self.write_state()?;
        self.inner.ensure_symbols(&mut state)?;
        state.name.clone().ok_or_else(|| self.inner.not_connected())
    }

    /// The extension's exported functions, fetched on first use.
    pub fn symbols(&self) -> BridgeResult<SymbolTable> {
        if let Some(symbols) = self.inner.state.read().symbols.clone() {
            return Ok(symbols);
        }
        let mut state = self.write_state()?;
        self.inner.ensure_symbols(&mut state).cloned()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> Receiver<ExtensionEvent> {
        self.inner.events.subscribe()
    }

    /// Bind a guest instance, registering every exported function under the
    /// extension's display name.
    pub fn bind(&self, registry: &mut dyn FunctionRegistry) -> BridgeResult<BoundInstance> {
        let module = self.name()?;
        self.bind_as(registry, &module)
    }

    /// Bind a guest instance, registering every exported function under
    /// `module`.
    pub fn bind_as(
        &self,
        registry: &mut dyn FunctionRegistry,
        module: &str,
    ) -> BridgeResult<BoundInstance> {
        let mut state = self.write_state()?;
        let definitions = self.inner.ensure_symbols(&mut state)?.functions().to_vec();

        let id = InstanceId(self.inner.next_instance.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(InstanceShared::new(
            id,
            module.to_string(),
            definitions,
            Arc::downgrade(&self.inner),
        ));

        for definition in &shared.definitions {
            let handler = CallDispatcher::new(Arc::clone(&shared), definition.clone()).into_handler();
            registry.register(module, definition, handler)?;
        }

        let connection = state
            .connection
            .as_ref()
            .ok_or_else(|| self.inner.not_connected())?;
        if let Err(e) = self.inner.attach(connection, id) {
            shared.mark_closed();
            return Err(e);
        }

        state.instances.insert(id, Arc::clone(&shared));
        info!(
            extension = %self.inner.label(),
            instance = %id,
            module,
            functions = shared.definitions.len(),
            "Instance bound"
        );
        Ok(BoundInstance::new(shared))
    }

    /// Kill the child and start it again on the same working copy,
    /// re-attaching every instance.
    pub fn reconnect(&self) -> BridgeResult<()> {
        let events = {
            let mut state = self.write_state()?;
            self.inner.restart(&mut state)?
        };
        info!(extension = %self.inner.label(), "Extension reconnected");
        for event in events {
            self.inner.events.emit(event);
        }
        Ok(())
    }

    /// Reload from the watched binary now, without waiting for the watcher.
    ///
    /// Returns the content hash of the new build.
    pub fn reload(&self) -> BridgeResult<String> {
        self.inner.reload()
    }

    /// Stop watching, close every instance and kill the child.
    ///
    /// Waits for in-flight calls. Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.stop();
        }

        let mut state = self.inner.state.write();
        let instances: Vec<_> = state.instances.drain().collect();
        for (id, instance) in instances {
            instance.mark_closed();
            if let Some(connection) = state.connection.as_ref() {
                if let Err(e) = self.inner.release(connection, id) {
                    debug!(instance = %id, error = %e, "Release failed");
                }
            }
        }
        if let Some(connection) = state.connection.take() {
            connection.kill();
        }
        state.symbols = None;

        info!(extension = %self.inner.label(), "Extension closed");
    }

    fn write_state(&self) -> BridgeResult<parking_lot::RwLockWriteGuard<'_, ProcessState>> {
        let state = self.inner.state.write();
        if self.inner.is_closed() {
            return Err(BridgeError::ExtensionClosed);
        }
        Ok(state)
    }
}

impl std::fmt::Debug for ExtensionProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionProcess")
            .field("path", &self.inner.origin)
            .field("working_path", &self.inner.working.path())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Drop for ExtensionInner {
    fn drop(&mut self) {
        if let Some(mut watcher) = self.watcher.get_mut().take() {
            watcher.signal_stop();
        }
    }
}
