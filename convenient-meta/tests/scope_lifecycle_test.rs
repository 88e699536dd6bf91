//! Scope lifecycle: deriving per-recipe scopes, parsing them in parallel,
//! and round-tripping through snapshots and signatures.

use convenient_meta::{
    Conditional, DumpOptions, MetaConfig, MetaError, OVERRIDES, Operand, RawValue, Scope,
    ScopeSnapshot, Value,
};
use std::thread;

/// A base configuration shared by every recipe, like a parsed layer config.
fn base_scope() -> Scope {
    let mut scope = Scope::new();
    scope.set("DISTRO", "poky").unwrap();
    scope.set("MACHINE", "qemux86").unwrap();
    scope.set("TARGET_ARCH", "i586").unwrap();
    scope
        .set(OVERRIDES, "${DISTRO} ${MACHINE} class-target")
        .unwrap();
    scope.set("CFLAGS", "-O2").unwrap();
    scope.append_if("CFLAGS", "qemux86", " -march=${TARGET_ARCH}").unwrap();
    scope.append_if("CFLAGS", "class-native", " -native").unwrap();
    scope
}

#[test]
fn test_overrides_follow_their_own_dependencies() {
    let mut scope = base_scope();
    assert_eq!(
        scope.overrides().unwrap(),
        vec!["poky", "qemux86", "class-target"]
    );
    assert_eq!(scope.get("CFLAGS").unwrap(), Value::from("-O2 -march=i586"));

    // OVERRIDES is a list fed from a string; changing MACHINE reaches CFLAGS
    scope.set("MACHINE", "qemuarm").unwrap();
    assert!(!scope.is_cached("CFLAGS"));
    assert_eq!(scope.get("CFLAGS").unwrap(), Value::from("-O2"));
}

#[test]
fn test_derived_scopes_per_recipe() {
    // Initialize tracing to see invalidation cascades
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let base = base_scope();

    let recipes = [("busybox", "1.36.1"), ("zlib", "1.3"), ("openssl", "3.2.0")];
    let handles: Vec<_> = recipes
        .into_iter()
        .map(|(pn, pv)| {
            let mut scope = base.derive();
            thread::spawn(move || {
                scope.set("PN", pn).unwrap();
                scope.set("PV", pv).unwrap();
                scope.set("P", "${PN}-${PV}").unwrap();
                scope.append("CFLAGS", " -DPN=${PN}").unwrap();
                if pn == "zlib" {
                    scope.set(OVERRIDES, "class-native").unwrap();
                }
                (
                    scope.get("P").unwrap(),
                    scope.get("CFLAGS").unwrap(),
                    scope.signature().unwrap(),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(results[0].0, Value::from("busybox-1.36.1"));
    assert_eq!(
        results[0].1,
        Value::from("-O2 -DPN=busybox -march=i586")
    );
    assert_eq!(results[1].1, Value::from("-O2 -DPN=zlib -native"));
    assert_eq!(results[2].0, Value::from("openssl-3.2.0"));
    assert_ne!(results[0].2, results[2].2);

    // The base scope never saw any of it
    let mut base = base;
    assert!(!base.contains("PN"));
    assert_eq!(base.get("CFLAGS").unwrap(), Value::from("-O2 -march=i586"));
}

#[test]
fn test_var_mut_and_concat() {
    let mut scope = base_scope();
    scope.set("DEPENDS", vec!["virtual/libc"]).unwrap();
    {
        let mut depends = scope.var_mut("DEPENDS").unwrap();
        depends.append("zlib ${EXTRA}").unwrap();
        depends.prepend_if("class-target", vec!["gcc-cross"]).unwrap();
        depends.override_if("class-native", vec!["native-only"]).unwrap();
    }
    scope.set("EXTRA", "xz").unwrap();
    assert_eq!(
        scope.get("DEPENDS").unwrap(),
        Value::from(vec!["gcc-cross", "virtual/libc", "zlib", "xz"])
    );

    let sum = scope
        .concat(
            Operand::Named("DEPENDS"),
            Operand::Literal(Value::from("bzip2")),
        )
        .unwrap();
    scope.set("EXTRA", "lzma").unwrap();
    // The composition is an evaluated copy, not a live sum
    assert_eq!(
        scope.evaluate(&sum).unwrap(),
        Value::from(vec!["gcc-cross", "virtual/libc", "zlib", "xz", "bzip2"])
    );

    scope.set(OVERRIDES, "class-native").unwrap();
    assert_eq!(scope.get("DEPENDS").unwrap(), Value::from(vec!["native-only"]));
    assert!(
        scope
            .var_mut("DEPENDS")
            .unwrap()
            .unset_if(Conditional::Override, "class-native")
            .is_some()
    );
    assert_eq!(
        scope.get("DEPENDS").unwrap(),
        Value::from(vec!["virtual/libc", "zlib", "lzma"])
    );
}

#[test]
fn test_snapshot_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busybox.json");

    let mut scope = base_scope();
    scope.set("PN", "busybox").unwrap();
    scope.set("BPN", RawValue::expr("PN").unwrap()).unwrap();
    scope.set_flag("PN", "export", true).unwrap();
    let signature = scope.signature().unwrap();
    scope.export().unwrap().save(&path).unwrap();

    let mut restored = Scope::import(ScopeSnapshot::load(&path).unwrap()).unwrap();
    assert!(!restored.is_cached("CFLAGS"));
    assert_eq!(restored.get("BPN").unwrap(), Value::from("busybox"));
    assert_eq!(restored.get("CFLAGS").unwrap(), scope.get("CFLAGS").unwrap());
    assert_eq!(restored.signature().unwrap(), signature);
    assert_eq!(restored.exported_vars(), vec!["PN"]);

    // Mutating the restored scope behaves like the exported one
    restored.set("PN", "toybox").unwrap();
    assert_eq!(restored.get("BPN").unwrap(), Value::from("toybox"));
    assert_ne!(restored.signature().unwrap(), signature);
}

#[test]
fn test_dump_and_config() {
    let config = MetaConfig::from_yaml_str("nohash: [DATETIME]\ndefault_expand: clean\n").unwrap();
    let mut scope = Scope::with_config(config);
    scope.set("DATETIME", "20261019").unwrap();
    scope.set("IMAGE", "core-image-${DATETIME}${SUFFIX}").unwrap();

    let mut out = Vec::new();
    scope
        .dump(
            &mut out,
            &DumpOptions {
                signature: true,
                ..DumpOptions::default()
            },
        )
        .unwrap();
    let dump = String::from_utf8(out).unwrap();
    assert_eq!(dump, "IMAGE=\"core-image-${DATETIME}\"\n");

    // Build timestamps are written as references, so a rebuild keeps its signature
    let before = scope.signature().unwrap();
    scope.set("DATETIME", "20261020").unwrap();
    assert_eq!(
        scope.get("IMAGE").unwrap(),
        Value::from("core-image-20261020")
    );
    assert_eq!(scope.signature().unwrap(), before);
}

#[test]
fn test_import_env_only_fills_gaps() {
    let mut scope = base_scope();
    scope.set("OE_ENV_WHITELIST", vec!["BB_NUMBER_THREADS"]).unwrap();
    scope.set("TERM", "dumb").unwrap();

    let env = vec![
        ("BB_NUMBER_THREADS".to_string(), "8".to_string()),
        ("TERM".to_string(), "xterm".to_string()),
        ("HOME".to_string(), "/root".to_string()),
    ];
    let signature = scope.import_env(env).unwrap();

    assert_eq!(scope.get("BB_NUMBER_THREADS").unwrap(), Value::from("8"));
    assert_eq!(scope.get("TERM").unwrap(), Value::from("dumb"));
    assert!(!scope.contains("HOME"));
    assert_eq!(scope.env_signature(), Some(signature.as_str()));

    assert!(matches!(
        scope.get("__undefined"),
        Err(MetaError::UndefinedVariable(_))
    ));
}
