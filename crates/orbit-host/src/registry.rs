//! Registration points for extension-backed host functions.
//!
//! Binding an extension installs one [`HostHandler`] per exported function
//! into a [`FunctionRegistry`]. Two registries are provided:
//!
//! - Wasmtime's `Linker`, so guests import the functions directly
//! - [`HostFunctions`], an in-process table for driving an extension
//!   without a virtual machine

use std::collections::HashMap;
use std::sync::Arc;

use orbit_core::{FunctionDefinition, Value, ValueType};
use tracing::debug;
use wasmtime::{FuncType, Linker, Val, ValType};

use crate::context::CallerMemory;
use crate::error::{BridgeError, BridgeResult};
use crate::memory::GuestMemory;

/// A host function body: guest memory of the caller plus typed arguments in,
/// typed results out.
pub type HostHandler =
    Arc<dyn Fn(&mut dyn GuestMemory, &[Value]) -> BridgeResult<Vec<Value>> + Send + Sync>;

/// Something host functions can be registered into.
pub trait FunctionRegistry {
    /// Register `handler` as `module::definition.name`.
    fn register(
        &mut self,
        module: &str,
        definition: &FunctionDefinition,
        handler: HostHandler,
    ) -> BridgeResult<()>;
}

/// Information about a registered host function.
#[derive(Clone)]
pub struct RegisteredFunction {
    /// The import module name.
    pub module: String,
    /// The function signature.
    pub definition: FunctionDefinition,
    handler: HostHandler,
}

impl RegisteredFunction {
    /// Invoke the function.
    pub fn call(&self, memory: &mut dyn GuestMemory, args: &[Value]) -> BridgeResult<Vec<Value>> {
        (self.handler)(memory, args)
    }
}

impl std::fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("module", &self.module)
            .field("definition", &self.definition)
            .finish()
    }
}

/// An in-process table of host functions.
#[derive(Debug, Default, Clone)]
pub struct HostFunctions {
    functions: HashMap<(String, String), RegisteredFunction>,
}

impl HostFunctions {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a function.
    pub fn get(&self, module: &str, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(&(module.to_string(), name.to_string()))
    }

    /// Check if a function is registered.
    pub fn is_registered(&self, module: &str, name: &str) -> bool {
        self.get(module, name).is_some()
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Iterate over registered functions.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredFunction> {
        self.functions.values()
    }

    /// Call `module::name` with `args` against `memory`.
    pub fn call(
        &self,
        module: &str,
        name: &str,
        memory: &mut dyn GuestMemory,
        args: &[Value],
    ) -> BridgeResult<Vec<Value>> {
        let function = self
            .get(module, name)
            .ok_or_else(|| BridgeError::FunctionNotExported(format!("{module}::{name}")))?;
        function.call(memory, args)
    }
}

impl FunctionRegistry for HostFunctions {
    fn register(
        &mut self,
        module: &str,
        definition: &FunctionDefinition,
        handler: HostHandler,
    ) -> BridgeResult<()> {
        let key = (module.to_string(), definition.name.clone());
        if self.functions.contains_key(&key) {
            return Err(BridgeError::AlreadyRegistered {
                module: key.0,
                name: key.1,
            });
        }

        self.functions.insert(
            key,
            RegisteredFunction {
                module: module.to_string(),
                definition: definition.clone(),
                handler,
            },
        );

        debug!(module, name = %definition.name, "Registered host function");
        Ok(())
    }
}

impl<T: 'static> FunctionRegistry for Linker<T> {
    fn register(
        &mut self,
        module: &str,
        definition: &FunctionDefinition,
        handler: HostHandler,
    ) -> BridgeResult<()> {
        let ty = FuncType::new(
            self.engine(),
            definition.params.iter().copied().map(val_type),
            definition.results.iter().copied().map(val_type),
        );

        let name = definition.name.clone();
        self.func_new(module, &definition.name, ty, move |caller, params, results| {
            let args = params
                .iter()
                .map(value_from_val)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| BridgeError::ArgumentMismatch {
                    function: name.clone(),
                    expected: "primitive values".to_string(),
                    actual: format!("{params:?}"),
                })?;

            let mut memory = CallerMemory::new(caller);
            let outputs = handler(&mut memory, &args)?;
            if outputs.len() != results.len() {
                return Err(BridgeError::MalformedReturn {
                    function: name.clone(),
                    expected: results.len(),
                    actual: outputs.len(),
                }
                .into());
            }

            for (slot, value) in results.iter_mut().zip(outputs) {
                *slot = val_from_value(value);
            }
            Ok(())
        })
        .map_err(|e| BridgeError::RegistrationFailed {
            module: module.to_string(),
            name: definition.name.clone(),
            reason: e.to_string(),
        })?;

        debug!(module, name = %definition.name, "Registered host function");
        Ok(())
    }
}

/// Map a value type onto Wasmtime's.
pub fn val_type(ty: ValueType) -> ValType {
    match ty {
        ValueType::I32 => ValType::I32,
        ValueType::I64 => ValType::I64,
        ValueType::F32 => ValType::F32,
        ValueType::F64 => ValType::F64,
    }
}

/// Convert a Wasmtime value, if it is one of the primitive types.
pub fn value_from_val(val: &Val) -> Option<Value> {
    match *val {
        Val::I32(v) => Some(Value::I32(v)),
        Val::I64(v) => Some(Value::I64(v)),
        Val::F32(bits) => Some(Value::F32(f32::from_bits(bits))),
        Val::F64(bits) => Some(Value::F64(f64::from_bits(bits))),
        _ => None,
    }
}

/// Convert a primitive value into a Wasmtime value.
pub fn val_from_value(value: Value) -> Val {
    match value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
    }
}
