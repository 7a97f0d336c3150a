//! Function definitions exchanged during symbol discovery.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::value::{TypeSpec, ValueType};

/// Signature of one function exported by an extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionDefinition {
    /// Exported name, without any export marker.
    pub name: String,
    /// Parameter types, in order.
    pub params: Vec<ValueType>,
    /// Result types, in order.
    pub results: Vec<ValueType>,
}

impl FunctionDefinition {
    /// Create a definition from declared parameter and result types.
    ///
    /// Fails with [`CoreError::UnsupportedValueType`] if any declared type is
    /// outside the closed set, and [`CoreError::InvalidName`] for an empty
    /// name.
    pub fn new<P, R>(
        name: impl Into<String>,
        params: impl IntoIterator<Item = P>,
        results: impl IntoIterator<Item = R>,
    ) -> CoreResult<Self>
    where
        P: TypeSpec,
        R: TypeSpec,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::InvalidName(name));
        }

        let params = params
            .into_iter()
            .map(|p| p.resolve())
            .collect::<CoreResult<Vec<_>>>()?;
        let results = results
            .into_iter()
            .map(|r| r.resolve())
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(Self {
            name,
            params,
            results,
        })
    }
}

impl fmt::Display for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |types: &[ValueType]| {
            types
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "{}({}) -> ({})",
            self.name,
            join(&self.params),
            join(&self.results)
        )
    }
}

/// How an exported handler receives its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportKind {
    /// Parameters and results are primitives, marshaled automatically.
    Native,
    /// The handler receives the untyped word vector and marshals itself.
    Raw,
}

impl ExportKind {
    /// Prefix marking a declared name as an export of this kind.
    pub fn marker(self) -> &'static str {
        match self {
            ExportKind::Native => "W_",
            ExportKind::Raw => "X_",
        }
    }

    /// Derive the exported identifier from a declared name.
    ///
    /// The marker for this kind is stripped when present; names without a
    /// marker are exported as-is.
    pub fn export_name(self, declared: &str) -> CoreResult<String> {
        let name = declared.strip_prefix(self.marker()).unwrap_or(declared);
        if name.is_empty() {
            return Err(CoreError::InvalidName(declared.to_string()));
        }
        Ok(name.to_string())
    }
}

/// Descriptive metadata an extension reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtensionMeta {
    /// Display name, also used as the guest import module name.
    pub name: String,
}
