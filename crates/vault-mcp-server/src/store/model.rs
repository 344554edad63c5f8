use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two credential kinds. Selects the shape of the secret payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    WebLogin,
    ApiKey,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebLogin => "web_login",
            Self::ApiKey => "api_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web_login" => Some(Self::WebLogin),
            "api_key" => Some(Self::ApiKey),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted secret material. Never serialized to disk in the clear — the
/// store encrypts the JSON encoding of this value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretPayload {
    WebLogin {
        email: String,
        password: String,
    },
    ApiKey {
        api_key: String,
        headers: BTreeMap<String, String>,
    },
}

impl SecretPayload {
    /// Payload shape and service type must agree.
    pub fn matches(&self, service_type: ServiceType) -> bool {
        matches!(
            (self, service_type),
            (Self::WebLogin { .. }, ServiceType::WebLogin)
                | (Self::ApiKey { .. }, ServiceType::ApiKey)
        )
    }

    /// Every secret string in this payload, for the scrub pass.
    pub fn secret_values(&self) -> Vec<String> {
        match self {
            Self::WebLogin { email, password } => vec![password.clone(), email.clone()],
            Self::ApiKey { api_key, headers } => {
                let mut values = vec![api_key.clone()];
                values.extend(headers.values().cloned());
                values
            }
        }
    }
}

/// CSS selectors for driving a login form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selectors {
    pub email_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
}

/// One stored credential. `encrypted_data` is base64 of
/// `IV ‖ ciphertext ‖ tag` over the JSON-encoded [`SecretPayload`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub site_id: String,
    pub service_type: ServiceType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<Selectors>,
    pub encrypted_data: String,
}

impl Credential {
    pub fn meta(&self) -> CredentialMeta {
        CredentialMeta {
            id: self.id.clone(),
            site_id: self.site_id.clone(),
            service_type: self.service_type,
            active: self.active,
            created_at: self.created_at,
            updated_at: self.updated_at,
            login_url: self.login_url.clone(),
        }
    }
}

/// Metadata projection returned from list/get/add — structurally excludes the
/// ciphertext rather than blanking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialMeta {
    pub id: String,
    pub site_id: String,
    pub service_type: ServiceType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape_agrees_with_service_type() {
        let web = SecretPayload::WebLogin {
            email: "a@b.com".into(),
            password: "pw".into(),
        };
        assert!(web.matches(ServiceType::WebLogin));
        assert!(!web.matches(ServiceType::ApiKey));

        let api = SecretPayload::ApiKey {
            api_key: "sk-1".into(),
            headers: BTreeMap::new(),
        };
        assert!(api.matches(ServiceType::ApiKey));
        assert!(!api.matches(ServiceType::WebLogin));
    }

    #[test]
    fn payload_json_round_trip() {
        let api = SecretPayload::ApiKey {
            api_key: "sk-live-123".into(),
            headers: BTreeMap::from([("Authorization".into(), "Bearer sk-live-123".into())]),
        };
        let json = serde_json::to_string(&api).unwrap();
        assert!(json.contains("\"api_key\""));
        let back: SecretPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(api, back);

        let web = SecretPayload::WebLogin {
            email: "user@test.com".into(),
            password: "P@ssw0rd!".into(),
        };
        let json = serde_json::to_string(&web).unwrap();
        let back: SecretPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(web, back);
    }

    #[test]
    fn secret_values_cover_all_material() {
        let api = SecretPayload::ApiKey {
            api_key: "sk-abc".into(),
            headers: BTreeMap::from([
                ("Authorization".into(), "Bearer sk-abc".into()),
                ("X-Token".into(), "tok-123".into()),
            ]),
        };
        let values = api.secret_values();
        assert!(values.contains(&"sk-abc".to_string()));
        assert!(values.contains(&"Bearer sk-abc".to_string()));
        assert!(values.contains(&"tok-123".to_string()));
    }

    #[test]
    fn service_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ServiceType::WebLogin).unwrap(),
            "\"web_login\""
        );
        assert_eq!(ServiceType::parse("api_key"), Some(ServiceType::ApiKey));
        assert_eq!(ServiceType::parse("nope"), None);
    }
}
