use clap::Parser;

use super::*;

#[test]
fn defaults_use_filesystem_store() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(
        settings.store.backend,
        StoreBackend::Filesystem {
            path: PathBuf::from(DEFAULT_STORE_DIR)
        }
    );
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert_eq!(settings.memo.storage_mode, StorageMode::Both);
    assert!(settings.memo.resolve_in_parallel);
    assert!(settings.cleanup.policies.is_empty());
    assert_eq!(settings.cleanup.interval, Duration::from_secs(3600));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.store.backend = Some("postgres".to_string());

    let overrides = GlobalOverrides {
        log_level: Some("debug".to_string()),
        store_backend: Some("memory".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.store.backend, StoreBackend::Memory);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn postgres_requires_a_url() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("postgres".to_string());
    raw.store.url = Some("   ".to_string());

    let err = Settings::from_raw(raw).expect_err("missing url");
    assert!(matches!(err, LoadError::Invalid { key: "store.url", .. }));
}

#[test]
fn postgres_pool_needs_two_connections() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("postgres".to_string());
    raw.store.url = Some("postgres://localhost/memo".to_string());
    raw.store.max_connections = Some(1);

    let err = Settings::from_raw(raw).expect_err("pool too small");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "store.max_connections",
            ..
        }
    ));
}

#[test]
fn postgres_settings_resolve() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("Postgres".to_string());
    raw.store.url = Some(" postgres://localhost/memo ".to_string());
    raw.store.max_connections = Some(6);

    let settings = Settings::from_raw(raw).expect("valid settings");
    match settings.store.backend {
        StoreBackend::Postgres {
            url,
            max_connections,
        } => {
            assert_eq!(url, "postgres://localhost/memo");
            assert_eq!(max_connections.get(), 6);
        }
        other => panic!("unexpected backend {other:?}"),
    }
}

#[test]
fn unknown_backend_is_rejected() {
    let mut raw = RawSettings::default();
    raw.store.backend = Some("redis".to_string());

    let err = Settings::from_raw(raw).expect_err("unknown backend");
    assert!(err.to_string().contains("redis"));
}

#[test]
fn storage_mode_is_parsed() {
    let mut raw = RawSettings::default();
    raw.memo.storage_mode = Some("Persistent".to_string());
    raw.memo.resolve_in_parallel = Some(false);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.memo.storage_mode, StorageMode::Persistent);
    assert!(!settings.memo.resolve_in_parallel);

    let mut raw = RawSettings::default();
    raw.memo.storage_mode = Some("disk".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cleanup_policies_are_validated() {
    let mut raw = RawSettings::default();
    raw.cleanup.interval_minutes = Some(15);
    raw.cleanup.policies = vec![
        RawCleanupPolicy {
            namespace: Some("images".to_string()),
            max_age_minutes: Some(10_080),
        },
        RawCleanupPolicy {
            namespace: Some("diagrams".to_string()),
            max_age_minutes: Some(60),
        },
    ];

    let settings = Settings::from_raw(raw.clone()).expect("valid settings");
    assert_eq!(settings.cleanup.interval, Duration::from_secs(15 * 60));
    assert_eq!(settings.cleanup.policies.len(), 2);
    assert_eq!(settings.cleanup.policies[0].namespace, "images");
    assert_eq!(settings.cleanup.policies[0].max_age_minutes, 10_080);

    raw.cleanup.policies.push(RawCleanupPolicy {
        namespace: Some("images".to_string()),
        max_age_minutes: Some(5),
    });
    let err = Settings::from_raw(raw).expect_err("duplicate namespace");
    assert!(err.to_string().contains("listed twice"));
}

#[test]
fn cleanup_policy_without_age_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cleanup.policies = vec![RawCleanupPolicy {
        namespace: Some("images".to_string()),
        max_age_minutes: None,
    }];

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn zero_cleanup_interval_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cleanup.interval_minutes = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero interval");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cleanup.interval_minutes",
            ..
        }
    ));
}

#[test]
fn parse_cleanup_arguments() {
    let args = CliArgs::parse_from([
        "soffio-memo",
        "cleanup",
        "--namespace",
        "images",
        "--max-age-minutes",
        "1440",
        "--store-backend",
        "memory",
    ]);

    assert_eq!(args.overrides.store_backend.as_deref(), Some("memory"));
    match args.command {
        Command::Cleanup(cleanup) => {
            assert_eq!(cleanup.namespace, "images");
            assert_eq!(cleanup.max_age_minutes, 1440);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_fingerprint_arguments() {
    let args = CliArgs::parse_from([
        "soffio-memo",
        "fingerprint",
        "--exclude",
        "alt,title",
        r#"{"url":"https://example.com/a.png"}"#,
        "plain",
    ]);

    match args.command {
        Command::Fingerprint(fingerprint) => {
            assert_eq!(fingerprint.exclude, vec!["alt", "title"]);
            assert_eq!(fingerprint.args.len(), 2);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_sweep_and_inspect_arguments() {
    let sweep = CliArgs::parse_from(["soffio-memo", "sweep", "--watch"]);
    assert!(matches!(sweep.command, Command::Sweep(SweepArgs { watch: true })));

    let inspect = CliArgs::parse_from([
        "soffio-memo",
        "--database-url",
        "postgres://override",
        "inspect",
        "--namespace",
        "images",
        "--json",
    ]);
    assert_eq!(
        inspect.overrides.database_url.as_deref(),
        Some("postgres://override")
    );
    match inspect.command {
        Command::Inspect(args) => {
            assert_eq!(args.namespace, "images");
            assert!(args.json);
        }
        _ => panic!("wrong command parsed"),
    }
}
