//! Watch command - Report reloads of an extension as its binary changes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use orbit_bridge::prelude::*;

use super::ValueDisplay;
use crate::OutputFormat;

/// Arguments for the watch command.
#[derive(Args)]
pub struct WatchArgs {
    /// Path to the extension binary
    #[arg(required = true)]
    pub extension: PathBuf,

    /// Zero-argument function to call after every reload
    #[arg(long)]
    pub probe: Option<String>,

    /// Exit after this many events
    #[arg(long)]
    pub events: Option<usize>,
}

/// One reported event.
#[derive(Debug, Serialize)]
struct EventDisplay {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    functions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probe: Option<ProbeDisplay>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ProbeDisplay {
    Results(Vec<ValueDisplay>),
    Error(String),
}

impl From<&ExtensionEvent> for EventDisplay {
    fn from(event: &ExtensionEvent) -> Self {
        let mut display = Self {
            event: event.event_type(),
            path: None,
            hash: None,
            reason: None,
            instance: None,
            functions: Vec::new(),
            probe: None,
        };
        match event {
            ExtensionEvent::Reloaded { path, hash } => {
                display.path = Some(path.display().to_string());
                display.hash = Some(hash.clone());
            }
            ExtensionEvent::ProcessExited { path } => {
                display.path = Some(path.display().to_string());
            }
            ExtensionEvent::ReloadFailed { path, reason } => {
                display.path = Some(path.display().to_string());
                display.reason = Some(reason.clone());
            }
            ExtensionEvent::InstanceInvalidated {
                instance,
                functions,
            } => {
                display.instance = Some(instance.0);
                display.functions = functions.clone();
            }
        }
        display
    }
}

/// Execute the watch command.
pub fn execute(args: WatchArgs, config: BridgeConfig, format: OutputFormat, quiet: bool) -> Result<()> {
    let extension = ExtensionProcess::load_with_config(&args.extension, config.with_watch(true))
        .context("Failed to load extension")?;
    let events = extension.subscribe();

    let mut table = HostFunctions::new();
    let binding = extension.bind(&mut table).context("Failed to bind extension")?;
    let mut memory = LinearMemory::new(64 * 1024);

    if !quiet && matches!(format, OutputFormat::Human) {
        println!(
            "Watching {} ({} functions, hash {})",
            args.extension.display(),
            binding.functions().len(),
            extension.content_hash()
        );
    }

    let mut seen = 0;
    for event in events.iter() {
        let mut display = EventDisplay::from(&event);

        if let (ExtensionEvent::Reloaded { .. }, Some(probe)) = (&event, &args.probe) {
            display.probe = Some(match binding.call(probe, &mut memory, &[]) {
                Ok(values) => ProbeDisplay::Results(values.iter().map(ValueDisplay::from).collect()),
                Err(e) => ProbeDisplay::Error(e.to_string()),
            });
        }

        match format.json(&display)? {
            Some(json) => println!("{}", json),
            None => print_event(&display),
        }

        seen += 1;
        if args.events.is_some_and(|limit| seen >= limit) {
            break;
        }
    }

    extension.close();
    Ok(())
}

fn print_event(display: &EventDisplay) {
    let mut line = display.event.to_string();
    if let Some(path) = &display.path {
        line.push_str(&format!(" {}", path));
    }
    if let Some(hash) = &display.hash {
        line.push_str(&format!(" hash={}", hash));
    }
    if let Some(reason) = &display.reason {
        line.push_str(&format!(" reason={:?}", reason));
    }
    if let Some(instance) = display.instance {
        line.push_str(&format!(" instance={} functions={}", instance, display.functions.join(",")));
    }
    match &display.probe {
        Some(ProbeDisplay::Results(values)) => {
            let rendered: Vec<_> = values.iter().map(|v| v.value.as_str()).collect();
            line.push_str(&format!(" probe=[{}]", rendered.join(" ")));
        }
        Some(ProbeDisplay::Error(e)) => line.push_str(&format!(" probe_error={:?}", e)),
        None => {}
    }
    println!("{}", line);
}
