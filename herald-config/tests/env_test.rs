//! Integration tests for herald-config

use herald_config::*;

#[test]
fn test_prefixed_vars_are_isolated() {
    let loader = EnvLoader::with_prefix("HERALD_DEMO");
    let vars = loader.filter(vec![
        ("HERALD_DEMO_PORT".to_string(), "8080".to_string()),
        ("HERALD_OTHER_PORT".to_string(), "9090".to_string()),
    ]);

    assert_eq!(vars.parse::<u16>("port").unwrap(), Some(8080));
    assert_eq!(vars.len(), 1);
}

#[test]
fn test_missing_dotenv_file_is_ignored() {
    let loader = EnvLoader::default();
    assert!(loader.load_dotenv(Some("/nonexistent/herald/.env")).is_ok());
}

#[test]
fn test_parse_error_names_key() {
    let vars: Vars = [("retries", "many")].into_iter().collect();
    let err = vars.parse::<u32>("retries").unwrap_err();
    assert!(err.to_string().contains("retries"));
}
