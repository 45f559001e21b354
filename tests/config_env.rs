use clap::Parser;
use optimist::config::{self, CliArgs, LogFormat};
use serial_test::serial;
use tracing::level_filters::LevelFilter;

const MAX_ENTRIES_VAR: &str = "OPTIMIST__CACHE__MAX_ENTRIES";
const LOG_LEVEL_VAR: &str = "OPTIMIST__LOGGING__LEVEL";

fn with_env<T>(vars: &[(&str, &str)], body: impl FnOnce() -> T) -> T {
    // SAFETY: every test touching the process environment runs under `#[serial]`.
    unsafe {
        for (name, value) in vars {
            std::env::set_var(name, value);
        }
    }
    let result = body();
    unsafe {
        for (name, _) in vars {
            std::env::remove_var(name);
        }
    }
    result
}

#[test]
#[serial]
fn repository_defaults_load_without_overrides() {
    let cli = CliArgs::parse_from(["optimist"]);
    let settings = config::load(&cli).expect("default settings load");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache.max_entries, 500);
    assert_eq!(settings.cache.notice_capacity, 32);
}

#[test]
#[serial]
fn environment_overrides_file_values() {
    let settings = with_env(&[(MAX_ENTRIES_VAR, "12"), (LOG_LEVEL_VAR, "debug")], || {
        config::load(&CliArgs::parse_from(["optimist"]))
    })
    .expect("settings load");

    assert_eq!(settings.cache.max_entries, 12);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
#[serial]
fn cli_flags_override_environment() {
    let settings = with_env(&[(MAX_ENTRIES_VAR, "12")], || {
        config::load(&CliArgs::parse_from([
            "optimist",
            "--cache-max-entries",
            "3",
            "graph",
        ]))
    })
    .expect("settings load");

    assert_eq!(settings.cache.max_entries, 3);
}

#[test]
#[serial]
fn missing_explicit_config_file_is_an_error() {
    let cli = CliArgs::parse_from(["optimist", "--config-file", "does/not/exist.toml"]);
    assert!(matches!(
        config::load(&cli),
        Err(config::LoadError::Build(_))
    ));
}
