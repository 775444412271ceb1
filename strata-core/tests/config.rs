/// Checker configuration: loading, error limits and warning switches.
use std::io::Write;

use strata_ast::build::{Builder, FnSig};
use strata_ast::{DeclRef, Scope, Type};
use strata_core::{Checker, CheckerConfig, ConfigError, ErrorKind};

/// `n` functions, each referring to an undeclared name once.
fn broken_functions(b: &Builder, n: usize) -> Vec<DeclRef> {
    (0..n)
        .map(|i| {
            b.fn_decl(
                &format!("f{i}"),
                vec![],
                Type::void(),
                b.exp_s(b.var(&format!("missing{i}"))),
            )
        })
        .collect()
}

#[test]
fn every_error_is_reported_under_the_limit() {
    let b = Builder::new();
    let decls = broken_functions(&b, 4);
    let err = Checker::new().check_program(&decls).expect_err("four bad functions");
    assert_eq!(err.errors.len(), 4);
    assert_eq!(err.count(ErrorKind::Name), 4);
    assert!(err.warnings.is_empty());
}

#[test]
fn checking_stops_at_the_error_limit() {
    let b = Builder::new();
    let decls = broken_functions(&b, 6);
    let config = CheckerConfig {
        max_errors: 3,
        ..CheckerConfig::default()
    };
    let err = Checker::with_config(config)
        .check_program(&decls)
        .expect_err("six bad functions");
    assert_eq!(err.errors.len(), 3);
    assert_eq!(err.warnings.len(), 1);
    assert!(
        err.warnings[0].message.contains("too many errors"),
        "unexpected warning: {}",
        err.warnings[0].message
    );
}

#[test]
fn zero_limit_reports_everything() {
    let b = Builder::new();
    let decls = broken_functions(&b, 12);
    let config = CheckerConfig::from_toml_str("max_errors = 0").expect("valid config");
    let err = Checker::with_config(config)
        .check_program(&decls)
        .expect_err("twelve bad functions");
    assert_eq!(err.errors.len(), 12);
}

#[test]
fn fail_fast_stops_after_the_first_failing_declaration() {
    let b = Builder::new();
    let decls = broken_functions(&b, 5);
    let config =
        CheckerConfig::from_toml_str("[checker]\nfail_fast = true\n").expect("valid config");
    assert!(config.fail_fast);
    let err = Checker::with_config(config)
        .check_program(&decls)
        .expect_err("the first function is bad");
    assert_eq!(err.errors.len(), 1);
    assert!(err.errors[0].message.contains("missing0"));
}

#[test]
fn warnings_can_be_switched_off() {
    let b = Builder::new();
    let helper = || {
        b.fn_decl_sig(
            "helper",
            FnSig::new(Type::void()).scope(Scope::Static),
            b.skip(),
        )
    };

    let warnings = Checker::new().check_program(&[helper()]).expect("no errors");
    assert_eq!(warnings.len(), 1);

    let quiet = CheckerConfig::from_toml_str("warnings = false").expect("valid config");
    let warnings = Checker::with_config(quiet)
        .check_program(&[helper()])
        .expect("no errors");
    assert!(warnings.is_empty());
}

#[test]
fn config_file_is_loaded_from_disk() {
    let dir = std::env::temp_dir().join(format!("strata-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join("strata.toml");
    let mut file = std::fs::File::create(&path).expect("create config");
    writeln!(file, "[checker]\nmax_errors = 25\ndebug_flow = true").expect("write config");
    drop(file);

    let config = CheckerConfig::load(&path).expect("load config");
    assert_eq!(config.max_errors, 25);
    assert!(config.debug_flow);
    assert!(config.warnings);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_file_is_an_io_error() {
    let err = CheckerConfig::load("/nonexistent/strata.toml").expect_err("no such file");
    assert!(matches!(err, ConfigError::Io { .. }), "{err}");
    assert!(err.to_string().contains("/nonexistent/strata.toml"));
}

#[test]
fn unknown_keys_are_rejected() {
    let err = CheckerConfig::from_toml_str("max_errorz = 3").expect_err("typo in key");
    assert!(matches!(err, ConfigError::Parse(_)), "{err}");
}
