use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::{coerce_optional_string, coerce_string, coerce_timestamp, document_fields};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    /// Unknown roles fall back to `User`.
    pub fn parse(raw: &str) -> Role {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrador" => Role::Admin,
            _ => Role::User,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("admin"),
            Role::User => f.write_str("user"),
        }
    }
}

/// Application profile (`usuarios` collection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserProfile {
    pub id: String,
    #[serde(rename = "nome")]
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(rename = "fotoUrl")]
    pub photo_url: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    pub fn from_document(document: Value) -> Result<UserProfile> {
        let (id, mut fields) = document_fields(document)?;

        coerce_string(&mut fields, "nome");
        coerce_string(&mut fields, "email");
        coerce_optional_string(&mut fields, "fotoUrl");
        coerce_timestamp(&mut fields, "createdAt");
        let role = fields
            .remove("role")
            .and_then(|v| v.as_str().map(Role::parse))
            .unwrap_or_default();

        let mut profile: UserProfile = serde_json::from_value(Value::Object(fields))?;
        profile.id = id;
        profile.role = role;
        Ok(profile)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Profile fields a user may change
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UserProfilePatch {
    #[serde(rename = "nome", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "fotoUrl", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl UserProfilePatch {
    pub fn apply_to(&self, profile: &mut UserProfile) {
        if let Some(name) = &self.name {
            profile.name = name.clone();
        }
        if let Some(url) = &self.photo_url {
            profile.photo_url = Some(url.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_roles_are_users() {
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("superuser"), Role::User);
        let profile = UserProfile::from_document(json!({
            "id": "u1",
            "nome": "Ana",
            "role": "owner"
        }))
        .unwrap();
        assert_eq!(profile.role, Role::User);
        assert_eq!(profile.email, "");
        assert!(profile.photo_url.is_none());
    }

    #[test]
    fn admin_profile() {
        let profile = UserProfile::from_document(json!({
            "id": "u9",
            "nome": "Bia",
            "email": "bia@example.com",
            "role": "admin",
            "fotoUrl": "https://cdn/x.png"
        }))
        .unwrap();
        assert!(profile.is_admin());
        assert_eq!(profile.photo_url.as_deref(), Some("https://cdn/x.png"));
    }
}
