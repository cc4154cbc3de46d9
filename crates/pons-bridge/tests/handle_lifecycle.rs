use std::sync::Arc;

use pons_bridge::{guest_exports, host_exports, PeerObject, PeerTable, Side, NIL_HANDLE};

#[test]
fn retain_release_walk_reaches_zero_exactly_once() {
    let table = PeerTable::new();
    let handle = table.export(Arc::new("pinned".to_string()));
    assert_eq!(table.retain_count(handle), Some(1));
    for expected in [2, 3, 4] {
        table.retain(handle);
        assert_eq!(table.retain_count(handle), Some(expected));
    }
    for expected in [3, 2, 1] {
        table.release(handle).unwrap();
        assert_eq!(table.retain_count(handle), Some(expected));
    }
    table.release(handle).unwrap();
    assert_eq!(table.retain_count(handle), None);
    assert_eq!(table.live_count(), 0);
}

#[test]
fn resolve_returns_the_pinned_object_itself() {
    let table = PeerTable::new();
    let object: PeerObject = Arc::new(vec![1u8, 2, 3]);
    let handle = table.export(Arc::clone(&object));
    let resolved = table.resolve(handle).unwrap();
    assert!(Arc::ptr_eq(&resolved, &object));
    table.release(handle).unwrap();
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "release of stale peer handle")]
fn double_release_traps_in_debug_builds() {
    let table = PeerTable::new();
    let handle = table.export(Arc::new(7u8));
    table.release(handle).unwrap();
    let _ = table.release(handle);
}

#[cfg(not(debug_assertions))]
#[test]
fn double_release_reports_a_protocol_violation_in_release_builds() {
    let table = PeerTable::new();
    let handle = table.export(Arc::new(7u8));
    table.release(handle).unwrap();
    let err = table.release(handle).unwrap_err();
    assert!(matches!(err, pons_bridge::BridgeError::ProtocolViolation { .. }));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "release of nil peer handle")]
fn nil_release_traps_in_debug_builds() {
    let _ = PeerTable::new().release(NIL_HANDLE);
}

#[test]
#[should_panic(expected = "resolve of nil peer handle")]
fn nil_resolve_always_traps() {
    let _ = PeerTable::new().resolve(NIL_HANDLE);
}

#[cfg(not(debug_assertions))]
#[test]
fn stale_resolve_reports_a_protocol_violation_in_release_builds() {
    let table = PeerTable::new();
    let handle = table.export(Arc::new(3u32));
    table.release(handle).unwrap();
    let err = table.resolve(handle).unwrap_err();
    assert!(matches!(err, pons_bridge::BridgeError::ProtocolViolation { .. }));
}

#[test]
fn borrowed_exports_release_with_their_guard() {
    let table = PeerTable::new();
    let handle = {
        let guard = table.export_borrowed(Arc::new(5u64));
        let handle = guard.handle();
        assert_eq!(table.retain_count(handle), Some(1));
        assert_eq!(
            table.resolve(handle).unwrap().downcast_ref::<u64>(),
            Some(&5)
        );
        handle
    };
    assert_eq!(table.retain_count(handle), None);
}

#[test]
fn side_tables_are_independent() {
    let handle = host_exports().export(Arc::new(9i16));
    assert_eq!(guest_exports().retain_count(handle), None);
    assert_eq!(host_exports().retain_count(handle), Some(1));
    host_exports().release(handle).unwrap();
}

#[test]
fn concurrent_retain_release_settles_on_the_export_reference() {
    let exports = Side::Host.exports();
    let handle = exports.export(Arc::new("contended".to_string()));
    let mut workers = Vec::new();
    for _ in 0..8 {
        workers.push(std::thread::spawn(move || {
            for _ in 0..1000 {
                exports.retain(handle);
                exports.release(handle).unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(exports.retain_count(handle), Some(1));
    exports.release(handle).unwrap();
    assert_eq!(exports.retain_count(handle), None);
}
