//! # Orbit - Out-of-Process Host Functions
//!
//! Orbit lets a WebAssembly host call functions that live in a separate,
//! independently rebuilt process. An extension binary declares its exports;
//! the host launches it, discovers the exports and registers each one as an
//! import of its guest modules. While a call runs, the extension can read and
//! write the calling guest's linear memory.
//!
//! ## Features
//!
//! - **Isolation**: Extension code never runs inside the host process
//! - **Hot Reload**: Rebuilding the extension binary swaps the running child
//!   without unbinding guests
//! - **Typed Exports**: Signatures are derived from Rust function types
//! - **Memory Bridge**: Extensions address guest memory through the guest that
//!   made the call, and no other
//!
//! ## Host Side
//!
//! ```ignore
//! use orbit_bridge::prelude::*;
//! use wasmtime::{Engine, Linker};
//!
//! let engine = Engine::default();
//! let mut linker = Linker::<()>::new(&engine);
//!
//! let extension = ExtensionProcess::load("./target/debug/my-extension")?;
//! let _binding = extension.bind(&mut linker)?;
//!
//! for event in extension.subscribe() {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Extension Side
//!
//! ```ignore
//! use orbit_bridge::orbit_satellite::prelude::*;
//!
//! let exports = ExportRegistrar::new("my-extension")
//!     .native("W_add", |_: &CallContext, a: i32, b: i32| a.wrapping_add(b))
//!     .build()?;
//! orbit_bridge::orbit_satellite::serve(exports)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌───────────────────────────┐
//! │         host process         │        │     extension process     │
//! │                              │ stdin  │                           │
//! │  guest ──► orbit-host stub ──┼───────►│  orbit-satellite serve()  │
//! │    ▲            │            │        │          │                │
//! │    └── memory ◄─┘            │◄───────┼── memory requests         │
//! │                              │ stdout │                           │
//! │  watcher ── reload ──────────┼─ spawn │                           │
//! └──────────────────────────────┘        └───────────────────────────┘
//! ```

// Re-export from sub-crates
pub use orbit_core;
pub use orbit_host;
pub use orbit_satellite;

pub use orbit_core::{FunctionDefinition, Value, ValueType};
pub use orbit_host::{
    BoundInstance, BridgeConfig, BridgeError, BridgeResult, ExtensionEvent, ExtensionProcess,
    FunctionRegistry, GuestMemory, HostFunctions, LinearMemory,
};

/// Prelude module for convenient imports.
pub mod prelude {
    // Host types
    pub use orbit_host::{
        BoundInstance, BridgeConfig, BridgeError, BridgeResult, CallerMemory, ExtensionEvent,
        ExtensionProcess, FunctionRegistry, GuestMemory, HostFunctions, LinearMemory, SymbolTable,
    };

    // Shared types
    pub use orbit_core::{FunctionDefinition, InstanceId, Value, ValueType};

    // Common std types
    pub use std::sync::Arc;
    pub use std::time::Duration;
}
