use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Self-describing agent metadata published into the registry.
///
/// Unknown fields are preserved verbatim through the flattened maps so that
/// forward-compatible extensions survive a publish/fetch round trip.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub name: String,
    pub description: String,
    pub url: String,
    pub version: String,
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub security_schemes: Vec<SecurityScheme>,
    #[serde(default)]
    pub skills: Vec<AgentSkill>,
    pub interface: AgentInterface,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<AgentProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<CardSignature>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// Known boolean capability flags default to false; unknown flags are kept
/// in `extra` and round-trip untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub push_notifications: bool,
    #[serde(default)]
    pub extended_card: bool,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl AgentCapabilities {
    /// Names of all flags currently set, known and unknown alike.
    pub fn enabled_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.streaming {
            flags.push("streaming".to_string());
        }
        if self.push_notifications {
            flags.push("pushNotifications".to_string());
        }
        if self.extended_card {
            flags.push("extendedCard".to_string());
        }
        for (key, value) in &self.extra {
            if value.as_bool() == Some(true) {
                flags.push(key.clone());
            }
        }
        flags
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SecurityScheme {
    #[serde(rename = "apiKey", rename_all = "camelCase")]
    ApiKey {
        name: String,
        location: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(flatten)]
        extra: IndexMap<String, Value>,
    },
    #[serde(rename = "oauth2", rename_all = "camelCase")]
    OAuth2 {
        flow: OAuthFlow,
        token_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        authorization_url: Option<String>,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        scopes: IndexMap<String, String>,
        #[serde(flatten)]
        extra: IndexMap<String, Value>,
    },
    #[serde(rename = "jwt", rename_all = "camelCase")]
    Jwt {
        #[serde(skip_serializing_if = "Option::is_none")]
        bearer_format: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        jwks_url: Option<String>,
        #[serde(flatten)]
        extra: IndexMap<String, Value>,
    },
    #[serde(rename = "mTLS", rename_all = "camelCase")]
    MutualTls {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(flatten)]
        extra: IndexMap<String, Value>,
    },
}

impl SecurityScheme {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ApiKey { .. } => "apiKey",
            Self::OAuth2 { .. } => "oauth2",
            Self::Jwt { .. } => "jwt",
            Self::MutualTls { .. } => "mTLS",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OAuthFlow {
    ClientCredentials,
    AuthorizationCode,
    Password,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSkill {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_modes: Vec<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInterface {
    pub preferred_transport: Transport,
    pub default_input_modes: Vec<String>,
    pub default_output_modes: Vec<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Jsonrpc,
    Grpc,
    Http,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jsonrpc => "jsonrpc",
            Self::Grpc => "grpc",
            Self::Http => "http",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProvider {
    pub organization: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

/// Detached JWS over the canonical card (minus the signature itself).
/// Structural validation happens in the validator; cryptographic checks
/// are performed by the publish pipeline when `jwksUrl` is present.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardSignature {
    pub protected: String,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<IndexMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,
}

/// Provenance of an agent version.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CardSource {
    ByValue,
    ByUrl,
    Federated,
}
