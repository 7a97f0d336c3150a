//! Hot reload driven by the binary watcher.

mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use common::*;
use orbit_bridge::prelude::*;

fn is_reloaded(event: &ExtensionEvent) -> bool {
    matches!(event, ExtensionEvent::Reloaded { .. })
}

#[test]
fn test_slow_overwrite_reloads_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = stage(dir.path(), V1);
    let extension = load(&path, BridgeConfig::responsive());
    let events = extension.subscribe();
    let instance = bind(&extension);

    let before = call_i64(&instance, "build_tag");
    overwrite_slowly(V1, &path, &[0u8; 4096], 10, Duration::from_millis(100));

    let mut seen = Vec::new();
    let reloaded = wait_for(&events, &mut seen, is_reloaded).expect("no reload");
    let new_hash = match reloaded {
        ExtensionEvent::Reloaded { hash, .. } => hash,
        _ => unreachable!(),
    };
    assert_eq!(extension.content_hash(), new_hash);

    // The new build runs, and the instance survived without rebinding.
    let after = call_i64(&instance, "build_tag");
    assert_eq!(after, before + 4096);
    assert!(!instance.is_invalidated());
    let out = call(&instance, "attached_instances", &[]).unwrap();
    assert_eq!(out, vec![Value::I32(1)]);

    // Late events from the same write settle on an unchanged digest.
    thread::sleep(Duration::from_millis(1_500));
    seen.extend(events.try_iter());
    assert_eq!(seen.iter().filter(|e| is_reloaded(e)).count(), 1, "{seen:?}");
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, ExtensionEvent::ReloadFailed { .. })),
        "{seen:?}"
    );
}

#[test]
fn test_calls_during_reload_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let path = stage(dir.path(), V1);
    let extension = load(&path, BridgeConfig::responsive());
    let events = extension.subscribe();
    let instance = Arc::new(bind(&extension));

    let stop = Arc::new(AtomicBool::new(false));
    let caller = {
        let instance = Arc::clone(&instance);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut calls = 0u32;
            while !stop.load(Ordering::SeqCst) {
                let out = call(&instance, "add", &[Value::I32(20), Value::I32(22)]);
                assert_eq!(out.unwrap(), vec![Value::I32(42)]);
                calls += 1;
                thread::sleep(Duration::from_millis(5));
            }
            calls
        })
    };

    overwrite_slowly(V1, &path, &[1u8; 2048], 8, Duration::from_millis(100));
    let mut seen = Vec::new();
    assert!(wait_for(&events, &mut seen, is_reloaded).is_some(), "{seen:?}");

    // Keep calling for a moment on the new child.
    thread::sleep(Duration::from_millis(200));
    stop.store(true, Ordering::SeqCst);
    let calls = caller.join().unwrap();
    assert!(calls > 0);
}

#[test]
fn test_signature_drift_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let path = stage(dir.path(), V1);
    let extension = load(&path, BridgeConfig::responsive());
    let events = extension.subscribe();
    let old = bind(&extension);

    overwrite_slowly(V2, &path, &[], 4, Duration::from_millis(50));

    let mut seen = Vec::new();
    let invalidated = wait_for(&events, &mut seen, |e| {
        matches!(e, ExtensionEvent::InstanceInvalidated { .. })
    })
    .expect("no invalidation");
    match invalidated {
        ExtensionEvent::InstanceInvalidated {
            instance,
            functions,
        } => {
            assert_eq!(instance, old.id());
            assert!(functions.contains(&"add".to_string()));
            assert!(functions.contains(&"checksum".to_string()));
            assert!(!functions.contains(&"sleep_ms".to_string()));
        }
        _ => unreachable!(),
    }
    assert!(wait_for(&events, &mut seen, is_reloaded).is_some(), "{seen:?}");

    assert!(old.is_invalidated());
    assert_eq!(extension.instance_count(), 0);
    let err = call(&old, "add", &[Value::I32(1), Value::I32(2)]).unwrap_err();
    assert!(matches!(err, BridgeError::InstanceInvalidated { .. }), "{err}");

    // A fresh binding sees the new signature.
    let symbols = extension.symbols().unwrap();
    assert_eq!(
        symbols.get("add").unwrap().params,
        vec![ValueType::I64, ValueType::I64]
    );
    let fresh = bind(&extension);
    let out = call(&fresh, "add", &[Value::I64(1 << 40), Value::I64(1)]).unwrap();
    assert_eq!(out, vec![Value::I64((1 << 40) + 1)]);
}

#[test]
fn test_exited_process_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let path = stage(dir.path(), V1);
    let extension = load(&path, BridgeConfig::responsive());
    let events = extension.subscribe();
    let instance = bind(&extension);
    let before = extension.pid().unwrap();

    let err = call(&instance, "crash", &[Value::I32(3)]).unwrap_err();
    assert!(matches!(err, BridgeError::ExtensionUnreachable(_)), "{err}");

    let mut seen = Vec::new();
    assert!(
        wait_for(&events, &mut seen, |e| matches!(
            e,
            ExtensionEvent::ProcessExited { .. }
        ))
        .is_some(),
        "{seen:?}"
    );
    assert!(wait_for(&events, &mut seen, is_reloaded).is_some(), "{seen:?}");

    assert_ne!(extension.pid().unwrap(), before);
    let out = call(&instance, "add", &[Value::I32(1), Value::I32(1)]).unwrap();
    assert_eq!(out, vec![Value::I32(2)]);
}

#[test]
fn test_identical_rewrite_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = stage(dir.path(), V1);
    let extension = load(&path, BridgeConfig::responsive());
    let events = extension.subscribe();
    let pid = extension.pid().unwrap();

    fs::write(&path, fs::read(V1).unwrap()).unwrap();
    thread::sleep(Duration::from_millis(2_000));

    let seen: Vec<_> = events.try_iter().collect();
    assert!(seen.is_empty(), "{seen:?}");
    assert_eq!(extension.pid(), Some(pid));
}

#[test]
fn test_close_stops_watching() {
    let dir = tempfile::tempdir().unwrap();
    let path = stage(dir.path(), V1);
    let extension = load(&path, BridgeConfig::responsive());
    let events = extension.subscribe();

    extension.close();
    overwrite_slowly(V1, &path, &[2u8; 1024], 2, Duration::from_millis(50));
    thread::sleep(Duration::from_millis(1_000));

    assert!(events.try_iter().next().is_none());
    assert!(extension.pid().is_none());
}
