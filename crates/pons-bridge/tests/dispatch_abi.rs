use std::sync::Once;

use pons_bridge::{
    entries, mangle, parse_module_manifest, serve_sync, BridgeError, BridgedDecl, BridgedError,
    BridgedValue, CallError, Dispatcher, ModuleManifest, Side, Ty,
};

const GEO_MANIFEST: &str = r#"{
  "schema_version": "pons.module@0.1.0",
  "abi_major": 1,
  "module": "geo",
  "decls": [
    {"owner": "Point", "member": "translate", "params": ["f64", "f64"], "result": "f64"},
    {"member": "checked_sqrt", "params": ["f64"], "result": "f64", "throws": true},
    {"member": "flaky", "result": "unit", "throws": true},
    {"member": "bad_encoder", "result": "str"},
    {"member": "rotate", "params": ["f64"], "result": "f64"}
  ],
  "errors": [
    {"type_tag": "geo.range", "payload": "f64"}
  ]
}"#;

fn manifest() -> ModuleManifest {
    parse_module_manifest(GEO_MANIFEST).unwrap()
}

fn decl(member: &str) -> BridgedDecl {
    manifest()
        .decls
        .into_iter()
        .find(|d| d.member == member)
        .unwrap_or_else(|| panic!("no decl named {member}"))
}

/// Loads the geo module on the guest side and serves every entry except
/// `rotate`, which stays unregistered on purpose.
fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        entries(Side::Guest).load_module(&manifest()).unwrap();
        serve_sync(Side::Guest, &decl("translate"), |args| {
            let (BridgedValue::F64(x), BridgedValue::F64(dx)) = (&args[0], &args[1]) else {
                return Err(BridgedError::Message("bad argument shapes".to_string()));
            };
            Ok(BridgedValue::F64(x + dx))
        })
        .unwrap();
        serve_sync(Side::Guest, &decl("checked_sqrt"), |args| {
            let BridgedValue::F64(x) = &args[0] else {
                return Err(BridgedError::Message("bad argument shape".to_string()));
            };
            if *x < 0.0 {
                let thrown = BridgedError::registered("geo.range", BridgedValue::F64(*x))
                    .map_err(|e| BridgedError::Message(e.to_string()))?;
                return Err(thrown);
            }
            Ok(BridgedValue::F64(x.sqrt()))
        })
        .unwrap();
        serve_sync(Side::Guest, &decl("flaky"), |_args| {
            let io = std::io::Error::new(std::io::ErrorKind::Other, "flaky io path");
            Err(BridgedError::from_error(&io))
        })
        .unwrap();
        // Returns a value whose shape contradicts the declared result. The
        // serving glue turns the failed encode into a fault envelope.
        serve_sync(Side::Guest, &decl("bad_encoder"), |_args| {
            Ok(BridgedValue::I64(1))
        })
        .unwrap();
    });
}

#[test]
fn sync_calls_cross_and_return() {
    setup();
    let dispatcher = Dispatcher::new(Side::Guest);
    let got = dispatcher
        .call(
            &decl("translate"),
            &[BridgedValue::F64(1.5), BridgedValue::F64(2.25)],
        )
        .unwrap();
    assert_eq!(got, BridgedValue::F64(3.75));
}

#[test]
fn thrown_errors_arrive_with_their_typed_payload() {
    setup();
    let dispatcher = Dispatcher::new(Side::Guest);
    assert_eq!(
        dispatcher
            .call(&decl("checked_sqrt"), &[BridgedValue::F64(9.0)])
            .unwrap(),
        BridgedValue::F64(3.0)
    );

    let err = dispatcher
        .call(&decl("checked_sqrt"), &[BridgedValue::F64(-4.0)])
        .unwrap_err();
    let CallError::Thrown(BridgedError::Registered { type_tag, payload }) = &err else {
        panic!("expected a registered thrown error, got: {err}");
    };
    assert_eq!(type_tag, "geo.range");
    assert_eq!(*payload, BridgedValue::F64(-4.0));
}

#[test]
fn unregistered_error_types_degrade_to_messages() {
    setup();
    let err = Dispatcher::new(Side::Guest)
        .call(&decl("flaky"), &[])
        .unwrap_err();
    let CallError::Thrown(BridgedError::Message(message)) = &err else {
        panic!("expected a message error, got: {err}");
    };
    assert!(message.contains("flaky io path"), "got: {message}");
}

#[test]
fn glue_encode_failures_surface_as_remote_faults() {
    setup();
    let err = Dispatcher::new(Side::Guest)
        .call(&decl("bad_encoder"), &[])
        .unwrap_err();
    let CallError::Bridge(BridgeError::Remote { message }) = &err else {
        panic!("expected a remote fault, got: {err}");
    };
    assert!(message.contains("expected str"), "got: {message}");
}

#[test]
fn missing_symbol_and_unloaded_module_fail_distinctly() {
    setup();
    let dispatcher = Dispatcher::new(Side::Guest);

    let rotate = decl("rotate");
    let err = dispatcher
        .call(&rotate, &[BridgedValue::F64(0.5)])
        .unwrap_err();
    let CallError::Bridge(BridgeError::MissingSymbol { symbol }) = &err else {
        panic!("expected a missing symbol, got: {err}");
    };
    assert_eq!(*symbol, mangle(&rotate));

    let mut elsewhere = rotate;
    elsewhere.module = "astro".to_string();
    let err = dispatcher
        .call(&elsewhere, &[BridgedValue::F64(0.5)])
        .unwrap_err();
    let CallError::Bridge(BridgeError::LibraryNotLoaded { module }) = &err else {
        panic!("expected an unloaded module, got: {err}");
    };
    assert_eq!(module, "astro");
}

#[test]
fn wrong_argument_shapes_fail_before_dispatch() {
    setup();
    let dispatcher = Dispatcher::new(Side::Guest);

    let err = dispatcher
        .call(&decl("translate"), &[BridgedValue::F64(1.0)])
        .unwrap_err();
    assert!(
        matches!(err, CallError::Bridge(BridgeError::EncodingMismatch { .. })),
        "got: {err}"
    );

    let err = dispatcher
        .call(
            &decl("translate"),
            &[BridgedValue::F64(1.0), BridgedValue::Str("no".to_string())],
        )
        .unwrap_err();
    assert!(
        matches!(err, CallError::Bridge(BridgeError::EncodingMismatch { .. })),
        "got: {err}"
    );
}

#[test]
fn dispatch_paths_check_the_declared_call_shape() {
    setup();
    let dispatcher = Dispatcher::new(Side::Guest);

    let mut pretend_async = decl("translate");
    pretend_async.is_async = true;
    let err = dispatcher
        .call(
            &pretend_async,
            &[BridgedValue::F64(0.0), BridgedValue::F64(0.0)],
        )
        .unwrap_err();
    let CallError::Bridge(BridgeError::ProtocolViolation { what }) = &err else {
        panic!("expected a protocol violation, got: {err}");
    };
    assert!(what.contains("not synchronous"), "got: {what}");

    let err = dispatcher
        .call_async(
            &decl("translate"),
            &[BridgedValue::F64(0.0), BridgedValue::F64(0.0)],
        )
        .unwrap_err();
    let CallError::Bridge(BridgeError::ProtocolViolation { what }) = &err else {
        panic!("expected a protocol violation, got: {err}");
    };
    assert!(what.contains("not async"), "got: {what}");
}

#[test]
fn mangled_names_are_deterministic() {
    let translate = decl("translate");
    assert_eq!(
        mangle(&translate),
        "pons_m3_geo_t5_Point_f9_translate_s_f8_f8__f8"
    );
    assert_eq!(mangle(&translate), mangle(&decl("translate")));
}

#[test]
fn module_reload_is_rejected() {
    setup();
    let err = entries(Side::Guest).load_module(&manifest()).unwrap_err();
    let text = format!("{err:#}");
    assert!(text.contains("already loaded"), "got: {text}");
}

#[test]
fn runtime_module_name_cannot_be_served() {
    let reserved = BridgedDecl {
        module: "pons.rt".to_string(),
        owner: String::new(),
        member: "noop".to_string(),
        params: vec![],
        result: Ty::Unit,
        throws: false,
        is_async: false,
        streaming: false,
    };
    let err = serve_sync(Side::Guest, &reserved, |_args| Ok(BridgedValue::unit())).unwrap_err();
    let text = format!("{err:#}");
    assert!(text.contains("reserved"), "got: {text}");
}
