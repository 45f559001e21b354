use config::FileFormat;

use super::*;
use crate::cache::{CacheKey, MutationArgs};
use crate::forum::{default_graph, keys};

fn from_toml(source: &str) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(source, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

#[test]
fn defaults_apply_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache, CacheConfig::default());
    assert!(settings.invalidation.is_empty());
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.cache.max_entries = Some(100);

    let overrides = GlobalOverrides {
        log_level: Some("debug".to_string()),
        cache_max_entries: Some(5),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.max_entries, 5);
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
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("level should be rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn zero_notice_capacity_is_rejected() {
    let err = from_toml("[cache]\nnotice_capacity = 0\n").expect_err("capacity zero");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.notice_capacity",
            ..
        }
    ));
}

#[test]
fn cache_section_reads_from_file() {
    let settings = from_toml(
        r#"
        [cache]
        max_entries = 64
        stale_after_ms = 30000
        "#,
    )
    .expect("valid settings");

    assert_eq!(settings.cache.max_entries, 64);
    assert_eq!(settings.cache.stale_after_ms, 30_000);
    assert_eq!(settings.cache.notice_capacity, 32);
}

#[test]
fn invalidation_overrides_extend_or_replace_rules() {
    let settings = from_toml(
        r#"
        [invalidation.toggle-like]
        keys = ["feed/{article_id}"]

        [invalidation.update-profile]
        keys = ["user", "profile/{user_id}"]
        replace = true
        "#,
    )
    .expect("valid settings");
    assert_eq!(settings.invalidation.len(), 2);

    let graph = settings.invalidation_graph(default_graph());
    let like_keys = graph
        .resolve(keys::TOGGLE_LIKE, &keys::article_args("a1"))
        .expect("resolved");
    assert_eq!(like_keys.len(), 4);
    assert_eq!(like_keys[3], CacheKey::new(["feed", "a1"]));

    let profile_keys = graph
        .resolve(
            keys::UPDATE_PROFILE,
            &MutationArgs::new().with("user_id", "u1"),
        )
        .expect("resolved");
    assert_eq!(
        profile_keys,
        vec![CacheKey::root("user"), CacheKey::new(["profile", "u1"])]
    );
}

#[test]
fn malformed_invalidation_template_is_rejected() {
    let err = from_toml(
        r#"
        [invalidation.toggle-like]
        keys = ["like/{article_id"]
        "#,
    )
    .expect_err("template should be rejected");

    match err {
        LoadError::Invalid { key, reason } => {
            assert_eq!(key, "invalidation");
            assert!(reason.contains("toggle-like"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn extend_without_keys_is_rejected() {
    let err = from_toml("[invalidation.toggle-like]\nreplace = false\n").expect_err("no keys");
    assert!(matches!(err, LoadError::Invalid { .. }));
}

#[test]
fn default_to_no_command() {
    let args = CliArgs::parse_from(["optimist"]);
    assert!(args.command.is_none());
    assert!(args.config_file.is_none());
}

#[test]
fn parse_simulate_arguments() {
    let args = CliArgs::parse_from([
        "optimist",
        "simulate",
        "--fail-like",
        "--latency-ms",
        "5",
        "--log-level",
        "debug",
    ]);

    assert_eq!(args.overrides.log_level.as_deref(), Some("debug"));
    match args.command.expect("simulate command") {
        Command::Simulate(simulate) => {
            assert!(simulate.fail_like);
            assert!(!simulate.fail_comment);
            assert_eq!(simulate.latency_ms, 5);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_graph_with_cache_overrides() {
    let args = CliArgs::parse_from([
        "optimist",
        "--cache-max-entries",
        "10",
        "graph",
        "--json",
        "--log-json",
        "true",
    ]);

    assert!(matches!(args.command, Some(Command::Graph(GraphArgs { json: true }))));
    assert_eq!(args.overrides.cache_max_entries, Some(10));
    assert_eq!(args.overrides.log_json, Some(true));
}
