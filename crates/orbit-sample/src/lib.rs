//! Sample extensions.
//!
//! Two generations of the same extension, served by the
//! `orbit-sample-extension` and `orbit-sample-extension-v2` binaries. The
//! second changes the signature of `add` and drops most other exports, so
//! swapping one binary for the other exercises signature drift.

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use orbit_satellite::prelude::*;
use orbit_satellite::ExportError;
use parking_lot::Mutex;

/// Display name of both generations.
pub const NAME: &str = "sample";

/// Bytes written per memory request by `fill`.
const FILL_CHUNK: usize = 4096;

/// The first generation.
pub fn exports() -> Result<Exports, ExportError> {
    let attached: Arc<Mutex<HashSet<InstanceId>>> = Arc::default();
    let on_attach = Arc::clone(&attached);
    let on_release = Arc::clone(&attached);

    ExportRegistrar::new(NAME)
        .native("W_add", |_: &CallContext, a: i32, b: i32| a.wrapping_add(b))
        .native("W_echo_i32", |_: &CallContext, v: i32| v)
        .native("W_echo_i64", |_: &CallContext, v: i64| v)
        .native("W_echo_f32", |_: &CallContext, v: f32| v)
        .native("W_echo_f64", |_: &CallContext, v: f64| v)
        .native("W_mix", mix)
        .native("W_build_tag", build_tag)
        .native("W_checksum", checksum)
        .native("W_fill", fill)
        .native("W_read_available", read_available)
        .native("W_greet", greet)
        .native("W_greet_size", greet_size)
        .native("W_join_names", join_names)
        .native("W_sleep_ms", sleep_ms)
        .native("W_fail", |_: &CallContext| -> HandlerResult<i32> {
            Err(HandlerError::new("requested failure"))
        })
        .native("W_panic", |_: &CallContext| -> i32 { panic!("requested panic") })
        .native("W_crash", |_: &CallContext, code: i32| -> i32 { std::process::exit(code) })
        .native("W_attached_instances", move |_: &CallContext| {
            attached.lock().len() as i32
        })
        .raw("X_sum_all", ["i64", "i64", "i64"], ["i64"], |_, words| {
            Ok(vec![words.iter().fold(0u64, |acc, w| acc.wrapping_add(*w))])
        })
        .on_attach(move |id| {
            on_attach.lock().insert(id);
        })
        .on_release(move |id| {
            on_release.lock().remove(&id);
        })
        .build()
}

/// The second generation: `add` works on 64-bit integers.
pub fn exports_v2() -> Result<Exports, ExportError> {
    ExportRegistrar::new(NAME)
        .native("W_add", |_: &CallContext, a: i64, b: i64| a.wrapping_add(b))
        .native("W_build_tag", build_tag)
        .native("W_sleep_ms", sleep_ms)
        .build()
}

/// Serve `exports` on stdio, reporting failures on stderr.
pub fn run(exports: Result<Exports, ExportError>) -> ExitCode {
    orbit_satellite::init_logging();

    let exports = match exports {
        Ok(exports) => exports,
        Err(e) => {
            tracing::error!(error = %e, "Invalid exports");
            return ExitCode::FAILURE;
        }
    };

    match orbit_satellite::serve(exports) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn mix(_: &CallContext, a: i32, b: i64, c: f32, d: f64) -> (f64, i32) {
    (f64::from(a) + b as f64 + f64::from(c) + d, a)
}

/// Size of the running binary, which tells builds apart.
fn build_tag(_: &CallContext) -> HandlerResult<i64> {
    let exe = std::env::current_exe()?;
    Ok(std::fs::metadata(exe)?.len() as i64)
}

fn checksum(ctx: &CallContext, ptr: i32, len: i32) -> HandlerResult<i64> {
    let bytes = ctx.memory.read_bytes(ptr as u32, len as u32)?;
    Ok(bytes.iter().map(|&b| i64::from(b)).sum())
}

fn fill(ctx: &CallContext, ptr: i32, byte: i32, len: i32) -> HandlerResult<()> {
    let chunk = vec![byte as u8; FILL_CHUNK];
    let mut offset = ptr as u32;
    let mut remaining = len as usize;
    while remaining > 0 {
        let n = remaining.min(FILL_CHUNK);
        ctx.memory.write_bytes(offset, &chunk[..n])?;
        offset += n as u32;
        remaining -= n;
    }
    Ok(())
}

/// Read up to `len` bytes, returning how many were available.
fn read_available(ctx: &CallContext, ptr: i32, len: i32) -> HandlerResult<i32> {
    let mut buf = vec![0u8; len as usize];
    let n = ctx.memory.read_at(ptr as u32, &mut buf)?;
    Ok(n as i32)
}

fn greeting(ctx: &CallContext, ptr: i32, len: i32) -> HandlerResult<String> {
    let name = ctx.memory.read_string(ptr as u32, len as u32)?;
    Ok(format!("Hello, {name}!"))
}

fn greet(ctx: &CallContext, ptr: i32, len: i32, out: i32) -> HandlerResult<i32> {
    let text = greeting(ctx, ptr, len)?;
    ctx.memory.write_string(out as u32, &text)?;
    Ok(text.len() as i32)
}

fn greet_size(ctx: &CallContext, ptr: i32, len: i32, out: i32) -> HandlerResult<()> {
    let text = greeting(ctx, ptr, len)?;
    ctx.memory.write_string_size(out as u32, &text)?;
    Ok(())
}

fn join_names(ctx: &CallContext, ptr: i32, len: i32, out: i32) -> HandlerResult<i32> {
    let names = ctx.memory.read_string_slice(ptr as u32, len as u32)?;
    let joined = names.join(",");
    ctx.memory.write_string(out as u32, &joined)?;
    Ok(joined.len() as i32)
}

fn sleep_ms(_: &CallContext, ms: i32) -> i32 {
    thread::sleep(Duration::from_millis(ms.max(0) as u64));
    ms
}
