use pretty_assertions::assert_eq;
use rlm_engine::ConfigLoader;
use rlm_engine::RlmError;
use rlm_engine::SecurityMode;
use rlm_engine::TomlConfigLoader;
use rlm_engine::Tier;
use tempfile::TempDir;

#[test]
fn toml_document_configures_every_section() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = temp.path().join("rlm.toml");
    let toml = r#"
[root]
root_model = "local-small"
sub_model = "local-small"
mid_model = "local-large"
high_model = "remote-best"
sub_max_tokens = 512

[pricing.local-small]
input = 0.0
output = 0.0

[pricing.local-large]
input = 0.0
output = 0.0

[pricing.remote-best]
input = 3.0
output = 15.0

[budget]
max_session_budget_usd = 2.5
max_subcall_depth = 3

[sandbox]
security_mode = "restrictive"
allowed_modules = ["json", "re"]

[session]
max_turns = 8
max_concurrent_subcalls = 2

[trace]
ledger_path = "logs/ledger.jsonl"

[gateway]
local_base_url = "http://127.0.0.1:8080/v1"

[prompt]
template = "Q: {query}\nC: {context}"
"#;
    std::fs::write(&config_path, toml).expect("write config");

    let loaded = TomlConfigLoader {
        path: Some(config_path),
        budget_override_usd: None,
    }
    .load()
    .expect("load config");
    let config = loaded.config;

    assert!(loaded.warnings.is_empty());
    assert_eq!(config.models.model_for(Tier::High, 0), "remote-best");
    assert_eq!(config.models.max_tokens_for(1), 512);
    assert_eq!(config.budget.max_session_budget_micros, 2_500_000);
    assert_eq!(config.budget.max_subcall_depth, 3);
    assert_eq!(config.sandbox.policy.mode, SecurityMode::Restrictive);
    assert!(config.sandbox.policy.check_import("json").is_ok());
    assert!(config.sandbox.policy.check_import("socket").is_err());
    assert_eq!(config.session.max_turns, 8);
    assert_eq!(config.session.max_concurrent_subcalls, 2);
    assert_eq!(
        config.trace.ledger_path,
        std::path::PathBuf::from("logs/ledger.jsonl")
    );
    assert_eq!(config.gateway.local_base_url, "http://127.0.0.1:8080/v1");
    assert_eq!(config.prompt.render("q", "c", "p", "b"), "Q: q\nC: c");
}

#[test]
fn budget_flag_overrides_the_document() {
    let temp = TempDir::new().expect("tempdir");
    let config_path = temp.path().join("rlm.toml");
    std::fs::write(&config_path, "[budget]\nmax_session_budget_usd = 5.0\n").expect("write config");

    let loaded = TomlConfigLoader {
        path: Some(config_path),
        budget_override_usd: Some(0.10),
    }
    .load()
    .expect("load config");
    assert_eq!(loaded.config.budget.max_session_budget_micros, 100_000);
}

#[test]
fn missing_file_is_a_configuration_error() {
    let temp = TempDir::new().expect("tempdir");
    let err = TomlConfigLoader {
        path: Some(temp.path().join("absent.toml")),
        budget_override_usd: None,
    }
    .load()
    .expect_err("missing file");
    assert!(matches!(err, RlmError::ConfigValidation { .. }));
}

#[test]
fn no_path_means_defaults() {
    let loaded = TomlConfigLoader::default().load().expect("defaults");
    assert_eq!(loaded.config.session.max_turns, 20);
}
