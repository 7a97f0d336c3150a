//! Call command - Invoke one exported function.
//!
//! The call runs against a zeroed scratch memory standing in for a guest,
//! which can be seeded before the call and dumped after it.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use orbit_bridge::prelude::*;

use super::{ValueDisplay, parse_arguments};
use crate::OutputFormat;

/// Arguments for the call command.
#[derive(Args)]
pub struct CallArgs {
    /// Path to the extension binary
    #[arg(required = true)]
    pub extension: PathBuf,

    /// Function to call
    #[arg(required = true)]
    pub function: String,

    /// Arguments, parsed against the function's parameter types
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Size of the scratch guest memory in bytes
    #[arg(long, default_value = "65536")]
    pub memory_size: usize,

    /// Write text into memory before the call (OFFSET:TEXT)
    #[arg(long = "write", value_parser = parse_write)]
    pub writes: Vec<(usize, String)>,

    /// Print a memory range after the call (OFFSET:LEN)
    #[arg(long = "dump", value_parser = parse_range)]
    pub dumps: Vec<(usize, usize)>,
}

/// Call result.
#[derive(Debug, Serialize)]
struct CallReport {
    function: String,
    signature: String,
    results: Vec<ValueDisplay>,
    duration_us: u128,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    memory: Vec<DumpDisplay>,
}

#[derive(Debug, Serialize)]
struct DumpDisplay {
    offset: usize,
    hex: String,
    text: String,
}

/// Execute the call command.
pub fn execute(args: CallArgs, config: BridgeConfig, format: OutputFormat, quiet: bool) -> Result<()> {
    let extension = ExtensionProcess::load_with_config(&args.extension, config.with_watch(false))
        .context("Failed to load extension")?;

    let mut table = HostFunctions::new();
    let binding = extension.bind(&mut table).context("Failed to bind extension")?;
    let definition = binding
        .functions()
        .iter()
        .find(|def| def.name == args.function)
        .cloned()
        .with_context(|| format!("Extension does not export '{}'", args.function))?;
    let values = parse_arguments(&definition, &args.args)?;

    let mut memory = LinearMemory::new(args.memory_size);
    for (offset, text) in &args.writes {
        memory
            .write(*offset, text.as_bytes())
            .with_context(|| format!("Failed to seed memory at {}", offset))?;
    }

    if !quiet {
        tracing::info!(
            extension = %args.extension.display(),
            function = %definition.name,
            "Calling extension"
        );
    }

    let start = Instant::now();
    let result = table.call(binding.module(), &definition.name, &mut memory, &values);
    let duration = start.elapsed();

    binding.close();
    extension.close();
    let results = result.with_context(|| format!("Call to '{}' failed", definition.name))?;

    let mut dumps = Vec::with_capacity(args.dumps.len());
    for &(offset, len) in &args.dumps {
        let mut buf = vec![0u8; len];
        memory
            .read(offset, &mut buf)
            .with_context(|| format!("Failed to dump memory at {}", offset))?;
        dumps.push(DumpDisplay {
            offset,
            hex: buf.iter().map(|b| format!("{:02x}", b)).collect(),
            text: String::from_utf8_lossy(&buf).into_owned(),
        });
    }

    let report = CallReport {
        function: definition.name.clone(),
        signature: definition.to_string(),
        results: results.iter().map(ValueDisplay::from).collect(),
        duration_us: duration.as_micros(),
        memory: dumps,
    };

    // Output results
    if let Some(json) = format.json(&report)? {
        println!("{}", json);
        return Ok(());
    }

    let rendered: Vec<_> = report.results.iter().map(|r| r.value.as_str()).collect();
    println!("{}", rendered.join(" "));
    if !quiet {
        println!("  {} in {:?}", report.signature, duration);
    }
    for dump in &report.memory {
        println!("  [{}] {} {:?}", dump.offset, dump.hex, dump.text);
    }

    Ok(())
}

fn parse_write(text: &str) -> Result<(usize, String), String> {
    let (offset, value) = text
        .split_once(':')
        .ok_or_else(|| format!("expected OFFSET:TEXT, got '{}'", text))?;
    let offset = offset
        .parse()
        .map_err(|_| format!("invalid offset '{}'", offset))?;
    Ok((offset, value.to_string()))
}

fn parse_range(text: &str) -> Result<(usize, usize), String> {
    let (offset, len) = text
        .split_once(':')
        .ok_or_else(|| format!("expected OFFSET:LEN, got '{}'", text))?;
    let offset = offset
        .parse()
        .map_err(|_| format!("invalid offset '{}'", offset))?;
    let len = len.parse().map_err(|_| format!("invalid length '{}'", len))?;
    Ok((offset, len))
}
