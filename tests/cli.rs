use assert_cmd::Command;
use tempfile::TempDir;

fn olsyncd() -> Command {
    Command::cargo_bin("olsyncd").expect("binary")
}

#[test]
fn help_lists_subcommands() {
    let output = olsyncd().arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    for subcommand in ["run", "projects", "push", "pull", "fetch", "apply", "status"] {
        assert!(stdout.contains(subcommand), "missing {subcommand} in help");
    }
}

#[test]
fn status_with_empty_config_dir() {
    let tmp = TempDir::new().expect("tempdir");
    olsyncd()
        .env("OLSYNCD_CONFIG_DIR", tmp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicates::str::contains("no tracked projects"))
        .stdout(predicates::str::contains("no active watches"));
}

#[test]
fn malformed_settings_fail_loudly() {
    let tmp = TempDir::new().expect("tempdir");
    std::fs::write(tmp.path().join("config.toml"), "poll_interval_secs = \"soon\"")
        .expect("write config");
    olsyncd()
        .env("OLSYNCD_CONFIG_DIR", tmp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to parse"));
}
