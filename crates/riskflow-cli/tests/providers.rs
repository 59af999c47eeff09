use assert_cmd::Command;
use once_cell::sync::Lazy;
use predicates::str::contains;
use std::env;
use std::fs::write;
use std::sync::Mutex;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn reset_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("RISKFLOW_"))
        .collect();
    for key in keys {
        env::remove_var(key);
    }
}

#[test]
fn providers_lists_offline_fallback() {
    let _guard = ENV_LOCK.lock().unwrap();
    reset_env();
    let mut cmd = Command::cargo_bin("riskflow-cli").unwrap();
    cmd.args(["providers"])
        .assert()
        .success()
        .stdout(contains("1 provider(s) configured"))
        .stdout(contains("rules"))
        .stdout(contains("(circuit closed)"));
}

#[test]
fn providers_from_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    reset_env();
    let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write(
        file.path(),
        r#"
[[providers]]
name = "fast-rules"
kind = "heuristic"
priority = 1
cost_weight = 0.5

[[providers]]
name = "deep-rules"
kind = "heuristic"
priority = 2
capabilities = ["comprehensive"]
"#,
    )
    .unwrap();

    let path = file.path().to_str().unwrap();
    let output = Command::cargo_bin("riskflow-cli")
        .unwrap()
        .args(["--config", path, "providers", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let providers = value.as_array().unwrap();
    assert_eq!(providers.len(), 2);
    assert_eq!(providers[0]["name"], "fast-rules");
    assert_eq!(providers[1]["capabilities"][0], "comprehensive");
    assert_eq!(providers[0]["circuit"]["state"], "closed");
    assert_eq!(providers[0]["usage"]["total_tokens"], 0);
}
