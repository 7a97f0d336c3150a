//! Orbit Satellite - write extension processes for an Orbit host
//!
//! An extension is an ordinary binary that declares its exports and hands
//! them to [`serve`]. The host launches it, discovers the exports and
//! registers them as imports of its guest modules. Handlers reach the
//! calling guest's memory through [`CallContext::memory`].
//!
//! # Quick Start
//!
//! ```ignore
//! use orbit_satellite::prelude::*;
//!
//! fn main() {
//!     orbit_satellite::init_logging();
//!
//!     let exports = ExportRegistrar::new("greeter")
//!         .native("W_add", |_: &CallContext, a: i32, b: i32| a.wrapping_add(b))
//!         .native("W_greet", |ctx: &CallContext, ptr: i32, len: i32| -> HandlerResult<()> {
//!             let name = ctx.memory.read_string(ptr as u32, len as u32)?;
//!             ctx.memory.write_string(ptr as u32, &format!("hi {name}"))?;
//!             Ok(())
//!         })
//!         .build()
//!         .expect("valid exports");
//!
//!     if let Err(e) = orbit_satellite::serve(exports) {
//!         eprintln!("{e}");
//!         std::process::exit(1);
//!     }
//! }
//! ```

pub mod error;
pub mod handler;
pub mod memory;
pub mod registrar;
pub mod serve;

// Re-export main types at crate root
pub use error::{ExportError, HandlerError, HandlerResult, ServeError, ServeResult};
pub use handler::{CallContext, IntoResults, NativeHandler, RawHandler};
pub use memory::{MemoryClient, MemoryTransport, decode_slice, encode_slice};
pub use orbit_core::{ExtensionMeta, FunctionDefinition, InstanceId, Value, ValueType};
pub use registrar::{Export, ExportRegistrar, Exports, InstanceHook};
pub use serve::{serve, serve_with};

use tracing_subscriber::EnvFilter;

/// Send `tracing` output to stderr, filtered by `RUST_LOG`.
///
/// Stdout carries the protocol, so nothing else may write to it. Calling
/// this more than once is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{HandlerError, HandlerResult};
    pub use crate::handler::CallContext;
    pub use crate::memory::MemoryClient;
    pub use crate::registrar::{ExportRegistrar, Exports};
    pub use crate::serve::serve;
    pub use orbit_core::{InstanceId, ValueType};
}
