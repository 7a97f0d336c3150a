//! CLI commands.

pub mod call;
pub mod inspect;
pub mod watch;

use orbit_bridge::prelude::*;
use serde::Serialize;

/// A value as shown to the user.
#[derive(Debug, Serialize)]
pub struct ValueDisplay {
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub value: String,
}

impl From<&Value> for ValueDisplay {
    fn from(value: &Value) -> Self {
        Self {
            ty: value.value_type(),
            value: value.to_string(),
        }
    }
}

/// Parse textual arguments against a parameter list.
pub fn parse_arguments(definition: &FunctionDefinition, args: &[String]) -> anyhow::Result<Vec<Value>> {
    if args.len() != definition.params.len() {
        anyhow::bail!(
            "'{}' takes {} arguments, {} given",
            definition,
            definition.params.len(),
            args.len()
        );
    }
    definition
        .params
        .iter()
        .zip(args)
        .map(|(&ty, text)| {
            Value::parse(ty, text).ok_or_else(|| anyhow::anyhow!("'{}' is not a valid {}", text, ty))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let def =
            FunctionDefinition::new("mix", [ValueType::I32, ValueType::F64], [ValueType::I64])
                .unwrap();
        let values = parse_arguments(&def, &["-3".to_string(), "2.5".to_string()]).unwrap();
        assert_eq!(values, vec![Value::I32(-3), Value::F64(2.5)]);

        assert!(parse_arguments(&def, &["1".to_string()]).is_err());
        assert!(parse_arguments(&def, &["x".to_string(), "1".to_string()]).is_err());
    }
}
