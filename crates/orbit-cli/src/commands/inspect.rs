//! Inspect command - Load an extension and list its exports.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use orbit_bridge::prelude::*;

use crate::OutputFormat;

/// Arguments for the inspect command.
#[derive(Args)]
pub struct InspectArgs {
    /// Path to the extension binary
    #[arg(required = true)]
    pub extension: PathBuf,
}

/// Inspection result.
#[derive(Debug, Serialize)]
struct InspectionResult {
    path: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    hash: String,
    functions: Vec<FunctionDisplay>,
}

#[derive(Debug, Serialize)]
struct FunctionDisplay {
    name: String,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    signature: String,
}

impl From<&FunctionDefinition> for FunctionDisplay {
    fn from(def: &FunctionDefinition) -> Self {
        Self {
            name: def.name.clone(),
            params: def.params.clone(),
            results: def.results.clone(),
            signature: def.to_string(),
        }
    }
}

/// Execute the inspect command.
pub fn execute(args: InspectArgs, config: BridgeConfig, format: OutputFormat) -> Result<()> {
    let extension = ExtensionProcess::load_with_config(&args.extension, config.with_watch(false))
        .context("Failed to load extension")?;

    let name = extension.name().context("Failed to fetch extension metadata")?;
    let symbols = extension.symbols().context("Failed to list exports")?;

    let result = InspectionResult {
        path: args.extension.display().to_string(),
        name,
        pid: extension.pid(),
        hash: extension.content_hash(),
        functions: symbols.functions().iter().map(FunctionDisplay::from).collect(),
    };
    extension.close();

    // Output results
    if let Some(json) = format.json(&result)? {
        println!("{}", json);
        return Ok(());
    }

    println!("Extension: {}", result.path);
    println!("Name: {}", result.name);
    if let Some(pid) = result.pid {
        println!("PID: {}", pid);
    }
    println!("Hash: {}", result.hash);
    println!();

    println!("Functions ({}):", result.functions.len());
    for function in &result.functions {
        println!("  {}", function.signature);
    }

    Ok(())
}
