//! Tests for the `corral init` command, run against the built binary.
//!
//! `init` touches no database, so these only need a scratch config home.

use std::process::{Command, Output};

fn corral(config_home: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_corral"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env_remove("CORRAL_DATABASE_URL")
        .env_remove("CORRAL_TOKEN_SECRET")
        .output()
        .expect("failed to run corral binary")
}

#[test]
fn init_writes_a_config_file_once() {
    let tmp = tempfile::TempDir::new().unwrap();

    let out = corral(tmp.path(), &["init", "--db-url", "postgresql://db.internal:5432/corral"]);
    assert!(out.status.success(), "init failed: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("corral db-init"), "unexpected output: {stdout}");

    let path = tmp.path().join("corral").join("config.toml");
    let contents = std::fs::read_to_string(&path).unwrap();
    let parsed: toml::Value = toml::from_str(&contents).unwrap();
    assert_eq!(
        parsed["database"]["url"].as_str(),
        Some("postgresql://db.internal:5432/corral")
    );
    let secret = parsed["auth"]["token_secret"].as_str().unwrap();
    assert_eq!(secret.len(), 64);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let again = corral(tmp.path(), &["init"]);
    assert!(!again.status.success());
    assert!(String::from_utf8_lossy(&again.stderr).contains("already exists"));

    let forced = corral(tmp.path(), &["init", "--force"]);
    assert!(forced.status.success());
    let rewritten: toml::Value =
        toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_ne!(rewritten["auth"]["token_secret"].as_str(), Some(secret));
}

#[test]
fn commands_needing_a_secret_explain_how_to_get_one() {
    let tmp = tempfile::TempDir::new().unwrap();

    let out = corral(tmp.path(), &["pool", "list"]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("corral init"), "unexpected stderr: {stderr}");
}
