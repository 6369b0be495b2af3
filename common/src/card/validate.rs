use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::canonical::{canonical_bytes, content_hash};
use super::types::AgentCard;
use crate::config::{
    MAX_CARD_BYTES, MAX_DESCRIPTION_LENGTH, MAX_NAME_LENGTH, MAX_SECURITY_SCHEMES, MAX_SKILLS,
    MAX_TAGS_PER_SKILL, MAX_URL_LENGTH,
};
use crate::crypto::Hash;

const KNOWN_SCHEME_TYPES: &[&str] = &["apiKey", "oauth2", "jwt", "mTLS"];
const KNOWN_OAUTH_FLOWS: &[&str] = &["client_credentials", "authorization_code", "password"];
const KNOWN_TRANSPORTS: &[&str] = &["jsonrpc", "grpc", "http"];

/// One structural or semantic violation, addressed by JSON path.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardError {
    pub field_path: String,
    pub reason: String,
}

/// The full error set of a failed validation; the validator never stops at
/// the first problem.
#[derive(Clone, Debug)]
pub struct CardErrors(pub Vec<CardError>);

impl std::error::Error for CardErrors {}

impl fmt::Display for CardErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent card ({} errors)", self.0.len())?;
        for error in &self.0 {
            write!(f, "; {}: {}", error.field_path, error.reason)?;
        }
        Ok(())
    }
}

/// Validated, canonicalized card together with its content hash.
#[derive(Clone, Debug)]
pub struct ValidCard {
    pub card: AgentCard,
    pub canonical: Vec<u8>,
    pub content_hash: Hash,
}

struct Collector {
    errors: Vec<CardError>,
}

impl Collector {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn push(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.errors.push(CardError {
            field_path: path.into(),
            reason: reason.into(),
        });
    }

    fn finish(self) -> Result<(), CardErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CardErrors(self.errors))
        }
    }
}

/// Validate a raw JSON value as an Agent Card.
///
/// Returns the typed card, its canonical bytes and the content hash, or the
/// accumulated error set. Unknown fields anywhere in the card are permitted
/// and preserved.
pub fn validate_card(raw: &Value) -> Result<ValidCard, CardErrors> {
    let mut errors = Collector::new();

    let Some(root) = raw.as_object() else {
        errors.push("$", "card must be a JSON object");
        return Err(errors
            .finish()
            .expect_err("collector has at least one error"));
    };

    check_required_string(&mut errors, root, "name", MAX_NAME_LENGTH);
    check_required_string(&mut errors, root, "description", MAX_DESCRIPTION_LENGTH);
    check_url(&mut errors, root);
    check_version(&mut errors, root);
    check_capabilities(&mut errors, root);
    check_security_schemes(&mut errors, root);
    check_skills(&mut errors, root);
    check_interface(&mut errors, root);
    check_provider(&mut errors, root);
    check_signature(&mut errors, root);

    errors.finish()?;

    let canonical = canonical_bytes(raw);
    if canonical.len() > MAX_CARD_BYTES {
        return Err(CardErrors(vec![CardError {
            field_path: "$".to_string(),
            reason: format!(
                "canonical card is {} bytes, limit is {}",
                canonical.len(),
                MAX_CARD_BYTES
            ),
        }]));
    }

    // Structural checks above guarantee this succeeds for well-formed
    // input; any residual mismatch is reported as a card error, not a 500.
    let card: AgentCard = serde_json::from_value(raw.clone()).map_err(|e| {
        CardErrors(vec![CardError {
            field_path: "$".to_string(),
            reason: e.to_string(),
        }])
    })?;

    let content_hash = content_hash(&canonical);
    Ok(ValidCard {
        card,
        canonical,
        content_hash,
    })
}

fn check_required_string(
    errors: &mut Collector,
    root: &serde_json::Map<String, Value>,
    field: &str,
    max_len: usize,
) {
    match root.get(field) {
        None => errors.push(format!("$.{field}"), "required field is missing"),
        Some(Value::String(s)) if s.trim().is_empty() => {
            errors.push(format!("$.{field}"), "must not be empty")
        }
        Some(Value::String(s)) if s.len() > max_len => errors.push(
            format!("$.{field}"),
            format!("exceeds maximum length of {max_len}"),
        ),
        Some(Value::String(_)) => {}
        Some(_) => errors.push(format!("$.{field}"), "must be a string"),
    }
}

fn check_url(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("url") else {
        errors.push("$.url", "required field is missing");
        return;
    };
    let Some(raw) = value.as_str() else {
        errors.push("$.url", "must be a string");
        return;
    };
    if raw.len() > MAX_URL_LENGTH {
        errors.push("$.url", format!("exceeds maximum length of {MAX_URL_LENGTH}"));
        return;
    }
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(
            "$.url",
            format!("unsupported scheme '{}', expected http or https", url.scheme()),
        ),
        Err(_) => errors.push("$.url", "must be an absolute http(s) URL"),
    }
}

fn check_version(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("version") else {
        errors.push("$.version", "required field is missing");
        return;
    };
    let Some(raw) = value.as_str() else {
        errors.push("$.version", "must be a string");
        return;
    };
    if semver::Version::parse(raw).is_err() {
        errors.push("$.version", "must be a valid semantic version");
    }
}

fn check_capabilities(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("capabilities") else {
        errors.push("$.capabilities", "required field is missing");
        return;
    };
    let Some(map) = value.as_object() else {
        errors.push("$.capabilities", "must be an object");
        return;
    };
    // Known flags must be booleans when present; unknown entries pass
    // through untouched.
    for flag in ["streaming", "pushNotifications", "extendedCard"] {
        if let Some(v) = map.get(flag) {
            if !v.is_boolean() {
                errors.push(format!("$.capabilities.{flag}"), "must be a boolean");
            }
        }
    }
}

fn check_security_schemes(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("securitySchemes") else {
        errors.push("$.securitySchemes", "required field is missing");
        return;
    };
    let Some(schemes) = value.as_array() else {
        errors.push("$.securitySchemes", "must be an array");
        return;
    };
    if schemes.len() > MAX_SECURITY_SCHEMES {
        errors.push(
            "$.securitySchemes",
            format!("more than {MAX_SECURITY_SCHEMES} schemes"),
        );
    }
    for (i, scheme) in schemes.iter().enumerate() {
        let path = format!("$.securitySchemes[{i}]");
        let Some(map) = scheme.as_object() else {
            errors.push(path, "must be an object");
            continue;
        };
        let Some(kind) = map.get("type").and_then(Value::as_str) else {
            errors.push(format!("{path}.type"), "required field is missing");
            continue;
        };
        if !KNOWN_SCHEME_TYPES.contains(&kind) {
            errors.push(
                format!("{path}.type"),
                format!("unknown scheme type '{kind}', expected one of apiKey, oauth2, jwt, mTLS"),
            );
            continue;
        }
        match kind {
            "apiKey" => {
                for field in ["name", "location"] {
                    if map.get(field).and_then(Value::as_str).is_none() {
                        errors.push(format!("{path}.{field}"), "required for apiKey schemes");
                    }
                }
            }
            "oauth2" => {
                match map.get("flow").and_then(Value::as_str) {
                    Some(flow) if KNOWN_OAUTH_FLOWS.contains(&flow) => {
                        if flow == "authorization_code"
                            && map.get("authorizationUrl").and_then(Value::as_str).is_none()
                        {
                            errors.push(
                                format!("{path}.authorizationUrl"),
                                "required for the authorization_code flow",
                            );
                        }
                    }
                    Some(flow) => errors.push(
                        format!("{path}.flow"),
                        format!("unknown flow '{flow}'"),
                    ),
                    None => errors.push(format!("{path}.flow"), "required for oauth2 schemes"),
                }
                if map.get("tokenUrl").and_then(Value::as_str).is_none() {
                    errors.push(format!("{path}.tokenUrl"), "required for oauth2 schemes");
                }
            }
            // jwt and mTLS have no extra required fields
            _ => {}
        }
    }
}

fn check_skills(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("skills") else {
        errors.push("$.skills", "required field is missing");
        return;
    };
    let Some(skills) = value.as_array() else {
        errors.push("$.skills", "must be an array");
        return;
    };
    if skills.len() > MAX_SKILLS {
        errors.push("$.skills", format!("more than {MAX_SKILLS} skills"));
    }
    let mut seen_ids = HashSet::new();
    for (i, skill) in skills.iter().enumerate() {
        let path = format!("$.skills[{i}]");
        let Some(map) = skill.as_object() else {
            errors.push(path, "must be an object");
            continue;
        };
        match map.get("id").and_then(Value::as_str) {
            Some(id) if id.trim().is_empty() => {
                errors.push(format!("{path}.id"), "must not be empty")
            }
            Some(id) => {
                if !seen_ids.insert(id.to_string()) {
                    errors.push(format!("{path}.id"), format!("duplicate skill id '{id}'"));
                }
            }
            None => errors.push(format!("{path}.id"), "required field is missing"),
        }
        match map.get("tags").and_then(Value::as_array) {
            Some(tags) if tags.is_empty() => {
                errors.push(format!("{path}.tags"), "must not be empty")
            }
            Some(tags) => {
                if tags.len() > MAX_TAGS_PER_SKILL {
                    errors.push(
                        format!("{path}.tags"),
                        format!("more than {MAX_TAGS_PER_SKILL} tags"),
                    );
                }
                for (j, tag) in tags.iter().enumerate() {
                    if !tag.is_string() {
                        errors.push(format!("{path}.tags[{j}]"), "must be a string");
                    }
                }
            }
            None => errors.push(format!("{path}.tags"), "required non-empty array"),
        }
    }
}

fn check_interface(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("interface") else {
        errors.push("$.interface", "required field is missing");
        return;
    };
    let Some(map) = value.as_object() else {
        errors.push("$.interface", "must be an object");
        return;
    };
    match map.get("preferredTransport").and_then(Value::as_str) {
        Some(transport) if KNOWN_TRANSPORTS.contains(&transport) => {}
        Some(transport) => errors.push(
            "$.interface.preferredTransport",
            format!("unknown transport '{transport}', expected jsonrpc, grpc or http"),
        ),
        None => errors.push("$.interface.preferredTransport", "required field is missing"),
    }
    for field in ["defaultInputModes", "defaultOutputModes"] {
        match map.get(field).and_then(Value::as_array) {
            Some(modes) if modes.is_empty() => {
                errors.push(format!("$.interface.{field}"), "must not be empty")
            }
            Some(modes) => {
                for (j, mode) in modes.iter().enumerate() {
                    if !mode.is_string() {
                        errors.push(format!("$.interface.{field}[{j}]"), "must be a string");
                    }
                }
            }
            None => errors.push(format!("$.interface.{field}"), "required non-empty array"),
        }
    }
}

fn check_provider(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("provider") else {
        return;
    };
    let Some(map) = value.as_object() else {
        errors.push("$.provider", "must be an object");
        return;
    };
    if map.get("organization").and_then(Value::as_str).is_none() {
        errors.push("$.provider.organization", "required field is missing");
    }
}

fn check_signature(errors: &mut Collector, root: &serde_json::Map<String, Value>) {
    let Some(value) = root.get("signature") else {
        return;
    };
    let Some(map) = value.as_object() else {
        errors.push("$.signature", "must be an object");
        return;
    };
    for field in ["protected", "signature"] {
        if map.get(field).and_then(Value::as_str).is_none() {
            errors.push(format!("$.signature.{field}"), "required field is missing");
        }
    }
    if let Some(jwks) = map.get("jwksUrl") {
        match jwks.as_str().map(Url::parse) {
            Some(Ok(url)) if url.scheme() == "https" || url.scheme() == "http" => {}
            _ => errors.push("$.signature.jwksUrl", "must be an absolute http(s) URL"),
        }
    }
}
