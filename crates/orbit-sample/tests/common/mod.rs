//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use orbit_bridge::prelude::*;

pub const V1: &str = env!("CARGO_BIN_EXE_orbit-sample-extension");
pub const V2: &str = env!("CARGO_BIN_EXE_orbit-sample-extension-v2");

/// How long to wait for the watcher to react.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Copy a built extension into `dir`, so tests can rewrite it freely.
pub fn stage(dir: &Path, binary: &str) -> PathBuf {
    let path = dir.join("sample-extension");
    fs::copy(binary, &path).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A configuration without the watcher.
pub fn unwatched() -> BridgeConfig {
    BridgeConfig::default().with_watch(false)
}

pub fn load(path: &Path, config: BridgeConfig) -> ExtensionProcess {
    ExtensionProcess::load_with_config(path, config).unwrap()
}

/// Bind into a fresh in-process table.
pub fn bind(extension: &ExtensionProcess) -> BoundInstance {
    let mut table = HostFunctions::new();
    extension.bind(&mut table).unwrap()
}

pub fn call(instance: &BoundInstance, name: &str, args: &[Value]) -> BridgeResult<Vec<Value>> {
    let mut memory = LinearMemory::new(1024);
    instance.call(name, &mut memory, args)
}

pub fn call_i64(instance: &BoundInstance, name: &str) -> i64 {
    match call(instance, name, &[]).unwrap().as_slice() {
        [Value::I64(v)] => *v,
        other => panic!("unexpected results: {other:?}"),
    }
}

/// Overwrite `target` with `source` plus `trailer`, in `chunks` writes
/// separated by `pause`, like a slow copy or a linker writing its output.
pub fn overwrite_slowly(source: &str, target: &Path, trailer: &[u8], chunks: usize, pause: Duration) {
    let mut bytes = fs::read(source).unwrap();
    bytes.extend_from_slice(trailer);

    let mut file = File::create(target).unwrap();
    let chunk = bytes.len().div_ceil(chunks);
    for part in bytes.chunks(chunk) {
        file.write_all(part).unwrap();
        file.flush().unwrap();
        thread::sleep(pause);
    }
    file.sync_all().unwrap();
}

/// Wait for the first event matching `pred`, collecting everything seen.
pub fn wait_for(
    events: &crossbeam_channel::Receiver<ExtensionEvent>,
    seen: &mut Vec<ExtensionEvent>,
    pred: impl Fn(&ExtensionEvent) -> bool,
) -> Option<ExtensionEvent> {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        let event = events.recv_timeout(remaining).ok()?;
        seen.push(event.clone());
        if pred(&event) {
            return Some(event);
        }
    }
    None
}
