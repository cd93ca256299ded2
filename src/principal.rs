use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};
use crate::store::Store;

/// Which identity space a principal belongs to. Students and TPO staff can
/// hold mentorship chats; companies authenticate for other parts of the
/// portal and are never chat participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Student,
    TpoStaff,
    Company,
}

impl PrincipalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalKind::Student => "student",
            PrincipalKind::TpoStaff => "tpo_staff",
            PrincipalKind::Company => "company",
        }
    }

    pub fn parse(s: &str) -> ChatResult<Self> {
        match s {
            "student" => Ok(PrincipalKind::Student),
            "tpo_staff" => Ok(PrincipalKind::TpoStaff),
            "company" => Ok(PrincipalKind::Company),
            other => Err(ChatError::Internal(format!(
                "unknown principal kind: {other}"
            ))),
        }
    }
}

/// A resolved, authenticated identity. One row in the composite principal
/// table; the tagged kind replaces the old split user/company lookup so a
/// credential subject can never resolve ambiguously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    pub role: String,
    pub name: String,
    pub email: String,
}

/// JWT claims carried by a bearer credential.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Turns a bearer credential into a [`Principal`], or fails with
/// `Unauthenticated`. Stateless apart from the store handle.
#[derive(Clone)]
pub struct PrincipalResolver {
    store: Store,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl PrincipalResolver {
    pub fn new(store: Store, secret: &str) -> Self {
        Self {
            store,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate the credential and look the subject up in the principal
    /// table. Exactly one lookup; an unknown subject is indistinguishable
    /// from a bad token at the API surface.
    pub async fn resolve(&self, bearer: Option<&str>) -> ChatResult<Principal> {
        let header = bearer
            .ok_or_else(|| ChatError::Unauthenticated("missing bearer token".into()))?;
        let token = header.strip_prefix("Bearer ").unwrap_or(header);

        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| ChatError::Unauthenticated(format!("invalid token: {e}")))?;

        self.store
            .principal_by_id(&data.claims.sub)
            .await?
            .ok_or_else(|| ChatError::Unauthenticated("unknown subject".into()))
    }

    /// Sign a token for the given principal id. Used by the login flow and
    /// by seeding/tests.
    pub fn issue_token(&self, principal_id: &str, ttl: Duration) -> ChatResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: principal_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ChatError::Internal(format!("failed to sign token: {e}")))
    }
}
