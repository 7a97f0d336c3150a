//! Calls across the process boundary, against the sample extension.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use orbit_bridge::orbit_satellite::encode_slice;
use orbit_bridge::prelude::*;
use wasmtime::{Engine, Linker, Module, Store};

#[test]
fn test_symbols_and_name() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());

    assert_eq!(extension.name().unwrap(), "sample");
    let symbols = extension.symbols().unwrap();
    let add = symbols.get("add").unwrap();
    assert_eq!(add.params, vec![ValueType::I32, ValueType::I32]);
    assert_eq!(add.results, vec![ValueType::I32]);
    assert!(symbols.get("sum_all").is_some());
    assert!(symbols.get("W_add").is_none());
    assert!(extension.pid().is_some());
}

#[test]
fn test_add_wraps() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let out = call(&instance, "add", &[Value::I32(5), Value::I32(3)]).unwrap();
    assert_eq!(out, vec![Value::I32(8)]);

    let out = call(&instance, "add", &[Value::I32(i32::MAX), Value::I32(1)]).unwrap();
    assert_eq!(out, vec![Value::I32(i32::MIN)]);
}

#[test]
fn test_values_cross_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let cases = [
        ("echo_i32", Value::I32(-1)),
        ("echo_i32", Value::I32(i32::MIN)),
        ("echo_i64", Value::I64(i64::MIN)),
        ("echo_i64", Value::I64(-42)),
        ("echo_f32", Value::F32(f32::from_bits(0x7fc0_1234))),
        ("echo_f32", Value::F32(-0.0)),
        ("echo_f64", Value::F64(f64::from_bits(0x7ff8_0000_0000_abcd))),
        ("echo_f64", Value::F64(f64::NEG_INFINITY)),
    ];
    for (function, value) in cases {
        let out = call(&instance, function, &[value]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_bits(), value.to_bits(), "{function}({value})");
    }

    let out = call(
        &instance,
        "sum_all",
        &[Value::I64(i64::MAX), Value::I64(1), Value::I64(-1)],
    )
    .unwrap();
    assert_eq!(out, vec![Value::I64(i64::MAX)]);
}

#[test]
fn test_multiple_results() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let out = call(
        &instance,
        "mix",
        &[Value::I32(1), Value::I64(2), Value::F32(0.5), Value::F64(0.25)],
    )
    .unwrap();
    assert_eq!(out, vec![Value::F64(3.75), Value::I32(1)]);
}

#[test]
fn test_memory_strings() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let mut memory = LinearMemory::new(256);
    memory.write(0, b"orbit").unwrap();

    let out = instance
        .call("greet", &mut memory, &[Value::I32(0), Value::I32(5), Value::I32(64)])
        .unwrap();
    assert_eq!(out, vec![Value::I32(13)]);
    assert_eq!(&memory.as_slice()[64..77], b"Hello, orbit!");

    instance
        .call("greet_size", &mut memory, &[Value::I32(0), Value::I32(5), Value::I32(128)])
        .unwrap();
    assert_eq!(&memory.as_slice()[128..132], &13u32.to_le_bytes());

    let out = instance
        .call("checksum", &mut memory, &[Value::I32(0), Value::I32(5)])
        .unwrap();
    let expected: i64 = b"orbit".iter().map(|&b| i64::from(b)).sum();
    assert_eq!(out, vec![Value::I64(expected)]);
}

#[test]
fn test_string_slices() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let encoded = encode_slice(&["io", "", "europa"]).unwrap();
    let mut memory = LinearMemory::new(256);
    memory.write(0, &encoded).unwrap();

    let out = instance
        .call(
            "join_names",
            &mut memory,
            &[Value::I32(0), Value::I32(encoded.len() as i32), Value::I32(128)],
        )
        .unwrap();
    assert_eq!(out, vec![Value::I32(10)]);
    assert_eq!(&memory.as_slice()[128..138], b"io,,europa");
}

#[test]
fn test_large_write_spans_requests() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let mut memory = LinearMemory::new(64 * 1024);
    instance
        .call(
            "fill",
            &mut memory,
            &[Value::I32(100), Value::I32(0xab), Value::I32(10_000)],
        )
        .unwrap();

    let bytes = memory.as_slice();
    assert_eq!(bytes[99], 0);
    assert!(bytes[100..10_100].iter().all(|&b| b == 0xab));
    assert_eq!(bytes[10_100], 0);
}

#[test]
fn test_checksum_over_large_memory() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let len = 20 * 1024 * 1024;
    let mut memory = LinearMemory::from_bytes(vec![0xff; len]);
    let out = instance
        .call("checksum", &mut memory, &[Value::I32(0), Value::I32(len as i32)])
        .unwrap();
    assert_eq!(out, vec![Value::I64(len as i64 * 0xff)]);

    let out = call(&instance, "add", &[Value::I32(1), Value::I32(2)]).unwrap();
    assert_eq!(out, vec![Value::I32(3)]);
}

#[test]
fn test_memory_end() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let mut memory = LinearMemory::new(16);
    let out = instance
        .call("read_available", &mut memory, &[Value::I32(12), Value::I32(8)])
        .unwrap();
    assert_eq!(out, vec![Value::I32(4)]);

    let err = instance
        .call("checksum", &mut memory, &[Value::I32(12), Value::I32(8)])
        .unwrap_err();
    assert!(matches!(err, BridgeError::Remote { .. }), "{err}");

    let err = instance
        .call("read_available", &mut memory, &[Value::I32(16), Value::I32(4)])
        .unwrap_err();
    assert!(matches!(err, BridgeError::Remote { .. }), "{err}");
}

#[test]
fn test_handler_failures_are_remote() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    match call(&instance, "fail", &[]).unwrap_err() {
        BridgeError::Remote { function, message } => {
            assert_eq!(function, "fail");
            assert_eq!(message, "requested failure");
        }
        other => panic!("unexpected error: {other}"),
    }

    match call(&instance, "panic", &[]).unwrap_err() {
        BridgeError::Remote { message, .. } => assert!(message.contains("requested panic")),
        other => panic!("unexpected error: {other}"),
    }

    // The extension survives both.
    let out = call(&instance, "add", &[Value::I32(1), Value::I32(2)]).unwrap();
    assert_eq!(out, vec![Value::I32(3)]);
}

#[test]
fn test_argument_checks() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    let err = call(&instance, "add", &[Value::I32(1)]).unwrap_err();
    assert!(matches!(err, BridgeError::ArgumentMismatch { .. }));

    let err = call(&instance, "add", &[Value::I32(1), Value::F64(2.0)]).unwrap_err();
    assert!(matches!(err, BridgeError::ArgumentMismatch { .. }));

    let err = call(&instance, "subtract", &[]).unwrap_err();
    assert!(matches!(err, BridgeError::FunctionNotExported(_)));
}

#[test]
fn test_instances_are_multiplexed() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let first = Arc::new(bind(&extension));
    let second = Arc::new(bind(&extension));
    assert_ne!(first.id(), second.id());
    assert_eq!(extension.instance_count(), 2);

    let out = call(&first, "attached_instances", &[]).unwrap();
    assert_eq!(out, vec![Value::I32(2)]);

    let workers: Vec<_> = [(first.clone(), 1u8), (second.clone(), 7u8)]
        .into_iter()
        .map(|(instance, byte)| {
            thread::spawn(move || {
                let mut memory = LinearMemory::new(512);
                for round in 0..25u8 {
                    let value = byte + round;
                    instance
                        .call(
                            "fill",
                            &mut memory,
                            &[Value::I32(0), Value::I32(i32::from(value)), Value::I32(512)],
                        )
                        .unwrap();
                    let out = instance
                        .call("checksum", &mut memory, &[Value::I32(0), Value::I32(512)])
                        .unwrap();
                    assert_eq!(out, vec![Value::I64(512 * i64::from(value))]);
                    assert!(memory.as_slice().iter().all(|&b| b == value));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    second.close();
    assert!(second.is_closed());
    assert_eq!(extension.instance_count(), 1);
    let out = call(&first, "attached_instances", &[]).unwrap();
    assert_eq!(out, vec![Value::I32(1)]);

    let err = call(&second, "add", &[Value::I32(1), Value::I32(1)]).unwrap_err();
    assert!(matches!(err, BridgeError::InstanceClosed(_)));
}

#[test]
fn test_call_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = unwatched().with_call_timeout(Some(Duration::from_millis(200)));
    let extension = load(&stage(dir.path(), V1), config);
    let instance = bind(&extension);

    let err = call(&instance, "sleep_ms", &[Value::I32(3_000)]).unwrap_err();
    match err {
        BridgeError::CallTimedOut { function, timeout } => {
            assert_eq!(function, "sleep_ms");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Other calls are not held up by the abandoned one.
    let out = call(&instance, "add", &[Value::I32(2), Value::I32(2)]).unwrap();
    assert_eq!(out, vec![Value::I32(4)]);
}

#[test]
fn test_reconnect_reattaches() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);
    let before = extension.pid().unwrap();

    extension.reconnect().unwrap();

    assert_ne!(extension.pid().unwrap(), before);
    let out = call(&instance, "attached_instances", &[]).unwrap();
    assert_eq!(out, vec![Value::I32(1)]);
}

#[test]
fn test_manual_reload_reports_hash() {
    let dir = tempfile::tempdir().unwrap();
    let path = stage(dir.path(), V1);
    let extension = load(&path, unwatched());
    let events = extension.subscribe();
    let instance = bind(&extension);
    let before = extension.content_hash();

    fs::write(&path, {
        let mut bytes = fs::read(V1).unwrap();
        bytes.extend_from_slice(&[0u8; 512]);
        bytes
    })
    .unwrap();

    let hash = extension.reload().unwrap();
    assert_ne!(hash, before);
    assert_eq!(extension.content_hash(), hash);
    assert_eq!(
        fs::read_to_string(path.with_file_name("sample-extension.hash")).unwrap(),
        hash
    );
    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        ExtensionEvent::Reloaded {
            path: extension.path().to_path_buf(),
            hash: hash.clone(),
        }
    );

    let tag = call_i64(&instance, "build_tag");
    assert_eq!(tag as u64, fs::metadata(&path).unwrap().len());
}

#[test]
fn test_close() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());
    let instance = bind(&extension);

    extension.close();
    extension.close();
    assert!(extension.is_closed());
    assert!(extension.pid().is_none());
    assert!(instance.is_closed());

    let err = call(&instance, "add", &[Value::I32(1), Value::I32(1)]).unwrap_err();
    assert!(matches!(err, BridgeError::InstanceClosed(_)));

    let mut table = HostFunctions::new();
    assert!(matches!(
        extension.bind(&mut table),
        Err(BridgeError::ExtensionClosed)
    ));
}

#[test]
fn test_load_errors() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing");
    assert!(matches!(
        ExtensionProcess::load_with_config(&missing, unwatched()),
        Err(BridgeError::NotFound(_))
    ));

    let plain = dir.path().join("plain");
    fs::write(&plain, b"not a program").unwrap();
    fs::set_permissions(&plain, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(matches!(
        ExtensionProcess::load_with_config(&plain, unwatched()),
        Err(BridgeError::NotExecutable(_))
    ));
}

#[test]
fn test_handshake_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let chatty = dir.path().join("chatty");
    fs::write(&chatty, "#!/bin/sh\necho hello\nsleep 5\n").unwrap();
    fs::set_permissions(&chatty, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(matches!(
        ExtensionProcess::load_with_config(&chatty, unwatched()),
        Err(BridgeError::IncompatibleExtension(_))
    ));

    let silent = dir.path().join("silent");
    fs::write(&silent, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&silent, fs::Permissions::from_mode(0o755)).unwrap();
    match ExtensionProcess::load_with_config(&silent, unwatched()) {
        Err(BridgeError::IncompatibleExtension(reason)) => {
            assert!(reason.contains("exited before handshake"), "{reason}")
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_direct_launch_refused() {
    let output = Command::new(V1)
        .env_remove("ORBIT_EXTENSION_MAGIC")
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("must be launched by its host"));
}

#[test]
fn test_guest_calls_through_linker() {
    let dir = tempfile::tempdir().unwrap();
    let extension = load(&stage(dir.path(), V1), unwatched());

    let engine = Engine::default();
    let mut linker = Linker::<()>::new(&engine);
    let _binding = extension.bind(&mut linker).unwrap();

    let wasm = wat::parse_str(
        r#"
        (module
            (import "sample" "add" (func $add (param i32 i32) (result i32)))
            (import "sample" "greet" (func $greet (param i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "guest")
            (func (export "sum") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                call $add
            )
            (func (export "hello") (result i32)
                i32.const 0
                i32.const 5
                i32.const 32
                call $greet
            )
        )
    "#,
    )
    .unwrap();

    let module = Module::new(&engine, wasm).unwrap();
    let mut store = Store::new(&engine, ());
    let instance = linker.instantiate(&mut store, &module).unwrap();

    let sum = instance
        .get_typed_func::<(i32, i32), i32>(&mut store, "sum")
        .unwrap();
    assert_eq!(sum.call(&mut store, (40, 2)).unwrap(), 42);

    let hello = instance.get_typed_func::<(), i32>(&mut store, "hello").unwrap();
    assert_eq!(hello.call(&mut store, ()).unwrap(), 13);
    let memory = instance.get_memory(&mut store, "memory").unwrap();
    assert_eq!(&memory.data(&store)[32..45], b"Hello, guest!");
}
