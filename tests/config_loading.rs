use std::io::Write;
use std::time::Duration;

use serde_json::json;

use resctl::config::{
    ControllerConfig, ProjectFile, default_config_path, load_and_validate, parse_str,
};
use resctl::errors::ControllerError;
use resctl::logging::build_filter;
use resctl::reconciler::command::{COMMAND_KIND, CommandSpec, refresh_interval};
use resctl::types::ResourceName;
use resctl_test_utils::builders::{ProjectFileBuilder, ResourceConfigBuilder};

const SAMPLE: &str = r#"
[controller]
flush_interval_ms = 500

[store]
path = "state/catalog.json"

[resource.fetch]
cmd = "echo fetch"

[resource.build]
cmd = "echo build"
refs = ["fetch", "fetch"]
refresh_every_ms = 60000

[resource.probe]
cmd = "true"
hidden = true
"#;

#[test]
fn parses_sample_with_defaults() {
    let raw = parse_str(SAMPLE).expect("sample parses");
    let project = ProjectFile::try_from(raw).expect("sample is valid");

    assert_eq!(project.controller.flush_interval, Duration::from_millis(500));
    assert_eq!(
        project.controller.shutdown_timeout,
        ControllerConfig::default().shutdown_timeout
    );
    assert_eq!(project.controller.retrigger_slack, Duration::from_secs(1));
    assert_eq!(
        project.store.path.as_deref(),
        Some(std::path::Path::new("state/catalog.json"))
    );
    assert_eq!(project.resources["fetch"].kind, COMMAND_KIND);
    assert!(project.resources["probe"].hidden);
}

#[test]
fn declared_resources_carry_refs_and_command_spec() {
    let project = ProjectFile::try_from(parse_str(SAMPLE).unwrap()).unwrap();
    let declared = project.declared();

    let names: Vec<_> = declared.iter().map(|d| d.name.name.clone()).collect();
    assert_eq!(names, vec!["build", "fetch", "probe"]);

    let build = &declared[0];
    assert_eq!(build.name, ResourceName::new(COMMAND_KIND, "build"));
    assert_eq!(
        build.spec,
        json!({ "cmd": "echo build", "refresh_every_ms": 60000 })
    );
    // Duplicates are collapsed when the meta reaches the catalog.
    assert_eq!(build.meta().refs.len(), 2);

    let spec: CommandSpec = serde_json::from_value(build.spec.clone()).unwrap();
    assert_eq!(refresh_interval(&spec), Some(Duration::from_secs(60)));

    let probe = &declared[2];
    assert!(probe.hidden);
    assert_eq!(probe.spec, json!({ "cmd": "true", "refresh_every_ms": null }));
    let spec: CommandSpec = serde_json::from_value(probe.spec.clone()).unwrap();
    assert_eq!(refresh_interval(&spec), None);
}

#[test]
fn unknown_ref_is_rejected() {
    let raw = ProjectFileBuilder::new()
        .with_resource("a", ResourceConfigBuilder::new("true").refs("missing").build())
        .raw();
    let err = ProjectFile::try_from(raw).unwrap_err();
    match err {
        ControllerError::ConfigError(msg) => assert!(msg.contains("unknown reference 'missing'")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn cycle_is_rejected() {
    let raw = ProjectFileBuilder::new()
        .with_resource("a", ResourceConfigBuilder::new("true").refs("b").build())
        .with_resource("b", ResourceConfigBuilder::new("true").refs("c").build())
        .with_resource("c", ResourceConfigBuilder::new("true").refs("a").build())
        .raw();
    assert!(matches!(
        ProjectFile::try_from(raw),
        Err(ControllerError::DagCycle(_))
    ));
}

#[test]
fn invalid_values_are_rejected() {
    let empty_cmd = ProjectFileBuilder::new()
        .with_resource("a", ResourceConfigBuilder::new("   ").build())
        .raw();
    assert!(matches!(
        ProjectFile::try_from(empty_cmd),
        Err(ControllerError::ConfigError(_))
    ));

    let unknown_kind = ProjectFileBuilder::new()
        .with_resource("a", ResourceConfigBuilder::new("true").kind("nope").build())
        .raw();
    assert!(matches!(
        ProjectFile::try_from(unknown_kind),
        Err(ControllerError::ConfigError(_))
    ));

    let zero_refresh = ProjectFileBuilder::new()
        .with_resource("a", ResourceConfigBuilder::new("true").refresh_every_ms(0).build())
        .raw();
    assert!(matches!(
        ProjectFile::try_from(zero_refresh),
        Err(ControllerError::ConfigError(_))
    ));

    let self_ref = ProjectFileBuilder::new()
        .with_resource("a", ResourceConfigBuilder::new("true").refs("a").build())
        .raw();
    assert!(matches!(
        ProjectFile::try_from(self_ref),
        Err(ControllerError::ConfigError(_))
    ));

    let mut zero_flush = ProjectFileBuilder::new()
        .with_resource("a", ResourceConfigBuilder::new("true").build())
        .raw();
    zero_flush.controller.flush_interval_ms = 0;
    match ProjectFile::try_from(zero_flush) {
        Err(ControllerError::ConfigError(msg)) => assert!(msg.contains("flush_interval_ms")),
        other => panic!("unexpected result: {other:?}"),
    }

    let nothing = ProjectFileBuilder::new().raw();
    assert!(matches!(
        ProjectFile::try_from(nothing),
        Err(ControllerError::ConfigError(_))
    ));
}

#[test]
fn malformed_toml_is_a_toml_error() {
    assert!(matches!(
        parse_str("[resource.a\ncmd = 1"),
        Err(ControllerError::TomlError(_))
    ));
}

#[test]
fn loads_and_validates_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let project = load_and_validate(file.path()).expect("file loads");
    assert_eq!(project.resources.len(), 3);

    let missing = load_and_validate(file.path().with_extension("missing"));
    assert!(matches!(missing, Err(ControllerError::IoError(_))));

    assert_eq!(default_config_path(), std::path::PathBuf::from("Resctl.toml"));
}

#[test]
fn log_filter_prefers_cli_then_env() {
    use resctl::cli::LogLevel;
    use tracing::level_filters::LevelFilter;

    let hint = |f: tracing_subscriber::EnvFilter| f.max_level_hint();
    assert_eq!(
        hint(build_filter(Some(LogLevel::Debug), Some("warn"))),
        Some(LevelFilter::DEBUG)
    );
    assert_eq!(hint(build_filter(None, Some("resctl=trace"))), Some(LevelFilter::TRACE));
    assert_eq!(hint(build_filter(None, Some("  "))), Some(LevelFilter::INFO));
    assert_eq!(hint(build_filter(None, None)), Some(LevelFilter::INFO));
}

#[test]
fn cli_flags_parse() {
    use clap::Parser;
    use resctl::cli::{CliArgs, LogLevel};

    let args = CliArgs::try_parse_from(["resctl"]).unwrap();
    assert_eq!(args.config, default_config_path());
    assert!(!args.once && !args.dry_run);
    assert!(args.log_level.is_none());

    let args = CliArgs::try_parse_from([
        "resctl",
        "--config",
        "ci/Resctl.toml",
        "--once",
        "--log-level",
        "debug",
    ])
    .unwrap();
    assert_eq!(args.config, std::path::PathBuf::from("ci/Resctl.toml"));
    assert!(args.once);
    assert!(matches!(args.log_level, Some(LogLevel::Debug)));

    assert!(CliArgs::try_parse_from(["resctl", "--log-level", "loud"]).is_err());
}
