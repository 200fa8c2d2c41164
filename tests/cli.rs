use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
cmd = "pytest -x"

[services.REDIS_URL]
image = "redis:7"
port = 6379
format = "redis://{{Host}}:{{Port}}/0"
"#;

fn temaki() -> Command {
    let mut cmd = Command::cargo_bin("temaki").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn validate_text() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("temaki.toml"), CONFIG).unwrap();

    temaki()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration valid"))
        .stdout(predicate::str::contains("REDIS_URL <- redis:7 (6379/tcp)"));
}

#[test]
fn validate_finds_config_in_parent() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("temaki.yml"),
        "services:\n  AMQP_URL:\n    image: rabbitmq:3\n    port: 5672\n    format: \"amqp://{{.Host}}:{{.Port}}\"\n",
    )
    .unwrap();
    let nested = dir.path().join("pkg/sub");
    std::fs::create_dir_all(&nested).unwrap();

    temaki()
        .current_dir(&nested)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("AMQP_URL"));
}

#[test]
fn validate_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    std::fs::write(&path, CONFIG).unwrap();

    let output = temaki()
        .args(["validate", "--format", "json", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["cmd"], "pytest -x");
    assert_eq!(parsed["services"]["REDIS_URL"]["port"], 6379);
}

#[test]
fn validate_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("temaki.toml"),
        "[services.bad-name]\nimage = \"redis:7\"\nport = 6379\nformat = \"x\"\n",
    )
    .unwrap();

    temaki()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad-name"));
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().unwrap();

    temaki()
        .current_dir(dir.path())
        .args(["run", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No temaki configuration"));
}

#[test]
fn init_writes_starter_config() {
    let dir = TempDir::new().unwrap();

    temaki()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created temaki.toml"));

    temaki()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("DATABASE_URL"));

    // Refuses to overwrite
    temaki()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}
