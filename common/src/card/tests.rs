use serde_json::{json, Value};

use super::*;

pub fn sample_card_value(name: &str) -> Value {
    json!({
        "name": name,
        "description": "Finds and ranks recipes",
        "url": "https://agents.example.com/recipe",
        "version": "1.0.0",
        "capabilities": {
            "streaming": true
        },
        "securitySchemes": [
            {
                "type": "oauth2",
                "flow": "client_credentials",
                "tokenUrl": "https://auth.example.com/oauth/token"
            }
        ],
        "skills": [
            {
                "id": "search-recipes",
                "name": "Search recipes",
                "tags": ["cooking", "search"]
            }
        ],
        "interface": {
            "preferredTransport": "jsonrpc",
            "defaultInputModes": ["text/plain"],
            "defaultOutputModes": ["application/json"]
        },
        "provider": {
            "organization": "Example Kitchen",
            "url": "https://example.com"
        }
    })
}

#[test]
fn valid_card_passes_and_hashes() {
    let raw = sample_card_value("recipe-agent");
    let valid = validate_card(&raw).expect("card is valid");
    assert_eq!(valid.card.name, "recipe-agent");
    assert_eq!(valid.card.skills.len(), 1);
    assert_eq!(valid.content_hash, content_hash(&valid.canonical));
}

#[test]
fn validation_accumulates_all_errors() {
    let raw = json!({
        "name": "",
        "url": "ftp://example.com",
        "version": "not-semver",
        "capabilities": {"streaming": "yes"},
        "securitySchemes": [{"type": "oauth2"}],
        "skills": [{"id": "a", "tags": []}, {"id": "a", "tags": ["x"]}],
        "interface": {"preferredTransport": "carrier-pigeon"}
    });
    let errors = validate_card(&raw).expect_err("card is invalid");
    let paths: Vec<&str> = errors.0.iter().map(|e| e.field_path.as_str()).collect();
    // description missing, name empty, bad url/version/capability flag,
    // oauth2 missing flow+tokenUrl, empty tags, duplicate skill id,
    // unknown transport, missing interface modes
    assert!(paths.contains(&"$.description"));
    assert!(paths.contains(&"$.name"));
    assert!(paths.contains(&"$.url"));
    assert!(paths.contains(&"$.version"));
    assert!(paths.contains(&"$.capabilities.streaming"));
    assert!(paths.contains(&"$.securitySchemes[0].flow"));
    assert!(paths.contains(&"$.securitySchemes[0].tokenUrl"));
    assert!(paths.contains(&"$.skills[0].tags"));
    assert!(paths.contains(&"$.skills[1].id"));
    assert!(paths.contains(&"$.interface.preferredTransport"));
    assert!(paths.contains(&"$.interface.defaultInputModes"));
    assert!(errors.0.len() >= 11);
}

#[test]
fn validating_canonical_form_yields_same_hash() {
    let raw = sample_card_value("recipe-agent");
    let first = validate_card(&raw).expect("valid");

    let canonical: Value = serde_json::from_slice(&first.canonical).expect("canonical json");
    let second = validate_card(&canonical).expect("canonical form is still valid");
    assert_eq!(first.content_hash, second.content_hash);
}

#[test]
fn unknown_fields_are_preserved() {
    let mut raw = sample_card_value("recipe-agent");
    raw["x-custom-extension"] = json!({"enabled": true});
    raw["capabilities"]["experimentalBatching"] = json!(true);

    let valid = validate_card(&raw).expect("valid");
    assert!(valid.card.extra.contains_key("x-custom-extension"));
    assert!(valid
        .card
        .capabilities
        .enabled_flags()
        .contains(&"experimentalBatching".to_string()));

    // The preserved fields survive into the canonical bytes
    let text = String::from_utf8(valid.canonical.clone()).expect("utf8");
    assert!(text.contains("x-custom-extension"));
}

#[test]
fn oversized_card_is_rejected() {
    let mut raw = sample_card_value("big-agent");
    raw["padding"] = Value::String("x".repeat(crate::config::MAX_CARD_BYTES));
    let errors = validate_card(&raw).expect_err("too large");
    assert!(errors.0[0].reason.contains("bytes"));
}

#[test]
fn api_key_scheme_requires_name_and_location() {
    let mut raw = sample_card_value("agent");
    raw["securitySchemes"] = json!([{"type": "apiKey"}]);
    let errors = validate_card(&raw).expect_err("invalid scheme");
    let paths: Vec<&str> = errors.0.iter().map(|e| e.field_path.as_str()).collect();
    assert!(paths.contains(&"$.securitySchemes[0].name"));
    assert!(paths.contains(&"$.securitySchemes[0].location"));
}

#[test]
fn mtls_and_jwt_schemes_have_no_extra_requirements() {
    let mut raw = sample_card_value("agent");
    raw["securitySchemes"] = json!([{"type": "mTLS"}, {"type": "jwt"}]);
    let valid = validate_card(&raw).expect("valid");
    assert_eq!(valid.card.security_schemes.len(), 2);
    assert_eq!(valid.card.security_schemes[0].type_name(), "mTLS");
}
