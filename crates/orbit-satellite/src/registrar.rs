//! The export table, built once at extension startup.
//!
//! Exports are declared explicitly on an [`ExportRegistrar`]:
//!
//! - [`native`](ExportRegistrar::native) takes a typed Rust function and
//!   derives the signature from its parameter and return types
//! - [`raw`](ExportRegistrar::raw) takes a handler over transport words and
//!   a signature declared by type name
//!
//! Declared names may carry the export marker of their kind (`W_` for
//! native, `X_` for raw), which is stripped from the exported name.
//! Building fails if any declaration was invalid; no partial table is
//! ever served.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use orbit_core::{
    CallEnvelope, ExportKind, ExtensionMeta, FunctionDefinition, InstanceId, RemoteError, Request,
    Response, TypeSpec,
};
use tracing::{debug, info, warn};

use crate::error::{ExportError, HandlerResult};
use crate::handler::{CallContext, NativeHandler, RawHandler};
use crate::memory::{MemoryClient, MemoryTransport};

/// Called when a guest instance attaches or is released.
pub type InstanceHook = Arc<dyn Fn(InstanceId) + Send + Sync>;

/// One registered export.
#[derive(Clone)]
pub struct Export {
    /// The exported signature.
    pub definition: FunctionDefinition,
    /// How the handler receives its arguments.
    pub kind: ExportKind,
    handler: RawHandler,
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("definition", &self.definition)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Builder for an extension's export table.
///
/// # Example
///
/// ```ignore
/// use orbit_satellite::{CallContext, ExportRegistrar};
///
/// let exports = ExportRegistrar::new("math")
///     .native("W_add", |_: &CallContext, a: i32, b: i32| a.wrapping_add(b))
///     .raw("X_sum", ["i64", "i64"], ["i64"], |_, words| {
///         Ok(vec![words[0].wrapping_add(words[1])])
///     })
///     .build()?;
/// ```
#[must_use]
pub struct ExportRegistrar {
    meta: ExtensionMeta,
    exports: Vec<Export>,
    errors: Vec<ExportError>,
    on_attach: Option<InstanceHook>,
    on_release: Option<InstanceHook>,
}

impl ExportRegistrar {
    /// Start a table for the extension called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ExtensionMeta { name: name.into() },
            exports: Vec::new(),
            errors: Vec::new(),
            on_attach: None,
            on_release: None,
        }
    }

    /// Export a typed handler.
    pub fn native<Args, H>(mut self, declared: &str, handler: H) -> Self
    where
        H: NativeHandler<Args>,
        Args: 'static,
    {
        let definition = ExportKind::Native.export_name(declared).and_then(|name| {
            FunctionDefinition::new(name, H::param_types(), H::result_types())
        });
        self.push(declared, definition, ExportKind::Native, handler.into_raw());
        self
    }

    /// Export a handler over transport words, with a signature declared by
    /// type name.
    pub fn raw<P, R, F>(
        mut self,
        declared: &str,
        params: impl IntoIterator<Item = P>,
        results: impl IntoIterator<Item = R>,
        handler: F,
    ) -> Self
    where
        P: TypeSpec,
        R: TypeSpec,
        F: Fn(&CallContext, &[u64]) -> HandlerResult<Vec<u64>> + Send + Sync + 'static,
    {
        let definition = ExportKind::Raw
            .export_name(declared)
            .and_then(|name| FunctionDefinition::new(name, params, results));
        self.push(declared, definition, ExportKind::Raw, Arc::new(handler));
        self
    }

    /// Run `hook` whenever a guest instance attaches.
    pub fn on_attach(mut self, hook: impl Fn(InstanceId) + Send + Sync + 'static) -> Self {
        self.on_attach = Some(Arc::new(hook));
        self
    }

    /// Run `hook` whenever a guest instance is released.
    pub fn on_release(mut self, hook: impl Fn(InstanceId) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Arc::new(hook));
        self
    }

    fn push(
        &mut self,
        declared: &str,
        definition: orbit_core::CoreResult<FunctionDefinition>,
        kind: ExportKind,
        handler: RawHandler,
    ) {
        match definition {
            Ok(definition) => self.exports.push(Export {
                definition,
                kind,
                handler,
            }),
            Err(e) => self.errors.push(ExportError::from_core(declared, e)),
        }
    }

    /// Finish the table.
    ///
    /// Fails with the first declaration error, or on two exports with the
    /// same name.
    pub fn build(self) -> Result<Exports, ExportError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let mut index = HashMap::with_capacity(self.exports.len());
        for (i, export) in self.exports.iter().enumerate() {
            if index.insert(export.definition.name.clone(), i).is_some() {
                return Err(ExportError::DuplicateFunction(export.definition.name.clone()));
            }
        }

        info!(extension = %self.meta.name, exports = self.exports.len(), "Export table built");
        Ok(Exports {
            meta: self.meta,
            exports: self.exports,
            index,
            on_attach: self.on_attach,
            on_release: self.on_release,
        })
    }
}

/// A built export table.
pub struct Exports {
    meta: ExtensionMeta,
    exports: Vec<Export>,
    index: HashMap<String, usize>,
    on_attach: Option<InstanceHook>,
    on_release: Option<InstanceHook>,
}

impl Exports {
    /// The extension's metadata.
    pub fn meta(&self) -> &ExtensionMeta {
        &self.meta
    }

    /// Look up an export by name.
    pub fn get(&self, name: &str) -> Option<&Export> {
        self.index.get(name).map(|&i| &self.exports[i])
    }

    /// Every exported signature, in declaration order.
    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.exports.iter().map(|e| e.definition.clone()).collect()
    }

    /// Number of exports.
    pub fn len(&self) -> usize {
        self.exports.len()
    }

    /// Whether nothing is exported.
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// Answer one host request.
    ///
    /// Memory accesses made by a call go through `transport`.
    pub fn handle(&self, request: Request, transport: Arc<dyn MemoryTransport>) -> Response {
        match request {
            Request::Symbols => Response::Symbols(self.definitions()),
            Request::Meta => Response::Meta(self.meta.clone()),
            Request::Attach { instance } => {
                debug!(%instance, "Instance attached");
                if let Some(hook) = &self.on_attach {
                    hook(instance);
                }
                Response::Ack
            }
            Request::Release { instance } => {
                debug!(%instance, "Instance released");
                if let Some(hook) = &self.on_release {
                    hook(instance);
                }
                Response::Ack
            }
            Request::Call(envelope) => self.call(envelope, transport),
        }
    }

    fn call(&self, envelope: CallEnvelope, transport: Arc<dyn MemoryTransport>) -> Response {
        let CallEnvelope {
            function,
            broker,
            instance,
            inputs,
        } = envelope;

        let Some(export) = self.get(&function) else {
            warn!(%function, "Call to unknown export");
            return Response::Error(RemoteError::FunctionNotExported(function));
        };
        if inputs.len() != export.definition.params.len() {
            return Response::Error(RemoteError::ArgumentMismatch {
                function,
                expected: export.definition.params.len(),
                actual: inputs.len(),
            });
        }

        let ctx = CallContext {
            instance,
            memory: MemoryClient::new(broker, transport),
        };
        debug!(%function, %instance, %broker, "Serving call");

        match panic::catch_unwind(AssertUnwindSafe(|| (export.handler)(&ctx, &inputs))) {
            Ok(Ok(outputs)) => Response::Call { outputs },
            Ok(Err(e)) => {
                warn!(%function, error = %e, "Handler failed");
                Response::Error(RemoteError::HandlerFailed(e.to_string()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(%function, %message, "Handler panicked");
                Response::Error(RemoteError::HandlerFailed(format!("panicked: {message}")))
            }
        }
    }
}

impl std::fmt::Debug for Exports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exports")
            .field("meta", &self.meta)
            .field("exports", &self.exports)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
