//! Turning guest-triggered host-function calls into extension calls.

use std::sync::Arc;

use orbit_core::{FunctionDefinition, RemoteError, Response, Value, ValueType, decode_all, encode_all};
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::instance::InstanceShared;
use crate::memory::GuestMemory;
use crate::registry::HostHandler;
use crate::symbols::unexpected;

/// Dispatches calls of one bound function over its extension's link.
pub(crate) struct CallDispatcher {
    instance: Arc<InstanceShared>,
    definition: FunctionDefinition,
}

impl CallDispatcher {
    pub(crate) fn new(instance: Arc<InstanceShared>, definition: FunctionDefinition) -> Self {
        Self {
            instance,
            definition,
        }
    }

    /// Wrap the dispatcher as a registrable host function.
    pub(crate) fn into_handler(self) -> HostHandler {
        Arc::new(move |memory, args| self.dispatch(memory, args))
    }

    /// Invoke the function with `args`, serving memory requests against
    /// `memory` until the extension answers.
    ///
    /// Holds the extension's lock for reading across the whole call, so a
    /// reload waits for the call and the call never straddles two children.
    pub(crate) fn dispatch(
        &self,
        memory: &mut dyn GuestMemory,
        args: &[Value],
    ) -> BridgeResult<Vec<Value>> {
        let function = &self.definition.name;
        check_arguments(&self.definition, args)?;

        let extension = self
            .instance
            .extension
            .upgrade()
            .ok_or(BridgeError::ExtensionClosed)?;
        let state = extension.state.read();

        if self.instance.is_invalidated() {
            return Err(BridgeError::InstanceInvalidated {
                instance: self.instance.id,
                function: function.clone(),
            });
        }
        if self.instance.is_closed() {
            return Err(BridgeError::InstanceClosed(self.instance.id));
        }
        let connection = state.connection.as_ref().ok_or_else(|| {
            BridgeError::ExtensionUnreachable(format!("{}: not connected", extension.label()))
        })?;

        debug!(function = %function, instance = %self.instance.id, "Dispatching call");
        let response = connection.link().call(
            function,
            self.instance.id,
            encode_all(args),
            memory,
            extension.config.call_timeout,
        )?;
        drop(state);

        match response {
            Response::Call { outputs } => decode_all(&self.definition.results, &outputs)
                .ok_or_else(|| BridgeError::MalformedReturn {
                    function: function.clone(),
                    expected: self.definition.results.len(),
                    actual: outputs.len(),
                }),
            Response::Error(RemoteError::FunctionNotExported(name)) => {
                Err(BridgeError::FunctionNotExported(name))
            }
            Response::Error(RemoteError::ArgumentMismatch {
                function,
                expected,
                actual,
            }) => Err(BridgeError::ArgumentMismatch {
                function,
                expected: format!("{expected} arguments"),
                actual: format!("{actual} arguments"),
            }),
            Response::Error(RemoteError::HandlerFailed(message)) => Err(BridgeError::Remote {
                function: function.clone(),
                message,
            }),
            other => Err(unexpected(function, &other)),
        }
    }
}

/// Check `args` against the declared parameters.
pub(crate) fn check_arguments(definition: &FunctionDefinition, args: &[Value]) -> BridgeResult<()> {
    let matches = args.len() == definition.params.len()
        && args
            .iter()
            .zip(&definition.params)
            .all(|(arg, ty)| arg.value_type() == *ty);
    if matches {
        return Ok(());
    }

    Err(BridgeError::ArgumentMismatch {
        function: definition.name.clone(),
        expected: type_list(definition.params.iter().copied()),
        actual: type_list(args.iter().map(Value::value_type)),
    })
}

fn type_list(types: impl Iterator<Item = ValueType>) -> String {
    types.map(ValueType::name).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_arguments() {
        let def =
            FunctionDefinition::new("add", [ValueType::I32, ValueType::I32], [ValueType::I32])
                .unwrap();

        assert!(check_arguments(&def, &[Value::I32(1), Value::I32(2)]).is_ok());

        let err = check_arguments(&def, &[Value::I32(1), Value::I64(2)]).unwrap_err();
        match err {
            BridgeError::ArgumentMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, "i32, i32");
                assert_eq!(actual, "i32, i64");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(check_arguments(&def, &[Value::I32(1)]).is_err());
    }
}
