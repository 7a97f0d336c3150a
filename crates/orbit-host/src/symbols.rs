//! Per-connection cache of the extension's exported functions.

use std::collections::HashMap;
use std::time::Duration;

use orbit_core::{ExtensionMeta, FunctionDefinition, InstanceId, Request, Response};

use crate::error::{BridgeError, BridgeResult};
use crate::link::Link;

/// Exported functions of one extension connection, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    functions: Vec<FunctionDefinition>,
    index: HashMap<String, usize>,
}

impl SymbolTable {
    /// Build a table, rejecting duplicate names.
    pub fn new(functions: Vec<FunctionDefinition>) -> BridgeResult<Self> {
        let mut index = HashMap::with_capacity(functions.len());
        for (i, function) in functions.iter().enumerate() {
            if index.insert(function.name.clone(), i).is_some() {
                return Err(BridgeError::Protocol(format!(
                    "duplicate export '{}'",
                    function.name
                )));
            }
        }
        Ok(Self { functions, index })
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&FunctionDefinition> {
        self.index.get(name).map(|&i| &self.functions[i])
    }

    /// All functions, in the order the extension reported them.
    pub fn functions(&self) -> &[FunctionDefinition] {
        &self.functions
    }

    /// Number of functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the extension exports nothing.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Names of bound functions that are missing from this table or whose
    /// signature differs.
    pub fn drift(&self, bound: &[FunctionDefinition]) -> Vec<String> {
        bound
            .iter()
            .filter(|def| self.get(&def.name) != Some(*def))
            .map(|def| def.name.clone())
            .collect()
    }

    /// Split bound instances into those this table still serves unchanged
    /// and those with drifted functions, paired with the drift.
    pub fn split_by_drift<'a>(
        &self,
        instances: impl IntoIterator<Item = (InstanceId, &'a [FunctionDefinition])>,
    ) -> (Vec<InstanceId>, Vec<(InstanceId, Vec<String>)>) {
        let mut unchanged = Vec::new();
        let mut drifted = Vec::new();
        for (id, bound) in instances {
            let drift = self.drift(bound);
            if drift.is_empty() {
                unchanged.push(id);
            } else {
                drifted.push((id, drift));
            }
        }
        (unchanged, drifted)
    }

    /// Fetch the table over `link`.
    pub(crate) fn fetch(link: &Link, timeout: Option<Duration>) -> BridgeResult<Self> {
        match link.request(Request::Symbols, timeout)? {
            Response::Symbols(functions) => Self::new(functions),
            other => Err(unexpected("symbols", &other)),
        }
    }
}

/// Fetch the extension's metadata over `link`.
pub(crate) fn fetch_meta(link: &Link, timeout: Option<Duration>) -> BridgeResult<ExtensionMeta> {
    match link.request(Request::Meta, timeout)? {
        Response::Meta(meta) => Ok(meta),
        other => Err(unexpected("meta", &other)),
    }
}

pub(crate) fn unexpected(request: &str, response: &Response) -> BridgeError {
    BridgeError::Protocol(format!("unexpected response to {request}: {response:?}"))
}
