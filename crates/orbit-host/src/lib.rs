//! Orbit Host - running host functions in a separate process
//!
//! This crate is the host side of the Orbit bridge. It loads an extension
//! binary as a child process, discovers the functions it exports, and
//! registers one host function per export into a guest's function table.
//! It includes:
//!
//! - [`ExtensionProcess`]: Load, reconnect, reload and close an extension
//! - [`BoundInstance`]: One guest instance's binding to an extension
//! - [`FunctionRegistry`]: Where bound functions are registered, implemented
//!   for Wasmtime's `Linker` and for the in-process [`HostFunctions`] table
//! - [`GuestMemory`]: The calling instance's linear memory, served to the
//!   extension for the duration of each call
//!
//! # Hot Reload
//!
//! Unless disabled in [`BridgeConfig`], the binary is watched. Once a
//! rewrite has settled the extension is restarted from the new build and
//! every bound instance is re-attached. Calls already running finish
//! against the old child; calls issued during the reload wait for it.
//!
//! # Example
//!
//! ```ignore
//! use orbit_host::{BridgeConfig, ExtensionProcess};
//! use wasmtime::{Engine, Linker};
//!
//! let engine = Engine::default();
//! let mut linker = Linker::<()>::new(&engine);
//!
//! let extension = ExtensionProcess::load_with_config(
//!     "./extensions/storage",
//!     BridgeConfig::responsive(),
//! )?;
//! let binding = extension.bind(&mut linker)?;
//!
//! // Guests instantiated from `linker` can now import the extension's
//! // functions from the module named after it.
//! ```

pub mod binary;
pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod events;
mod instance;
mod link;
pub mod memory;
mod process;
pub mod registry;
pub mod symbols;
mod watcher;

// Re-export main types
pub use config::BridgeConfig;
pub use context::CallerMemory;
pub use error::{BridgeError, BridgeResult};
pub use events::{EventChannel, ExtensionEvent};
pub use instance::BoundInstance;
pub use memory::{GuestMemory, LinearMemory, MemoryBridgeServer};
pub use process::ExtensionProcess;
pub use registry::{FunctionRegistry, HostFunctions, HostHandler, RegisteredFunction};
pub use symbols::SymbolTable;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::BridgeConfig;
    pub use crate::error::{BridgeError, BridgeResult};
    pub use crate::events::ExtensionEvent;
    pub use crate::instance::BoundInstance;
    pub use crate::memory::{GuestMemory, LinearMemory};
    pub use crate::process::ExtensionProcess;
    pub use crate::registry::{FunctionRegistry, HostFunctions};
}
