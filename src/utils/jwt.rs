use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use super::error::ApiError;

/// JWT claims for both authenticated and guest identities.
///
/// `sub` is the owner identifier sessions are keyed on. Guests get a fresh
/// UUID subject; authenticated users carry the identity the upstream OAuth
/// layer established.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub guest: bool,
    pub iat: i64,
    pub exp: i64,
}

/// Token issuing and verification
pub struct JwtUtil {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expires_secs: i64,
}

impl JwtUtil {
    /// `expires_in` accepts plain seconds or "24h" / "30m" / "7d" style values
    pub fn new(secret: &str, expires_in: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expires_secs: parse_expires(expires_in),
        }
    }

    /// Issue a token for a new guest identity. Returns (token, owner_id).
    pub fn issue_guest_token(&self) -> Result<(String, String), ApiError> {
        let owner_id = uuid::Uuid::new_v4().to_string();
        let token = self.issue(&owner_id, "guest", true)?;
        Ok((token, owner_id))
    }

    /// Issue a token for an externally authenticated user
    pub fn issue_user_token(&self, owner_id: &str, name: &str) -> Result<String, ApiError> {
        self.issue(owner_id, name, false)
    }

    fn issue(&self, sub: &str, name: &str, guest: bool) -> Result<String, ApiError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            name: name.to_string(),
            guest,
            iat: now,
            exp: now + self.expires_secs,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::internal_error(format!("Failed to sign token: {}", e)))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::TokenExpired,
                _ => ApiError::unauthorized(format!("Invalid token: {}", e)),
            })
    }
}

fn parse_expires(input: &str) -> i64 {
    if let Ok(secs) = input.parse::<i64>() {
        return secs;
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    let n: i64 = num_str.parse().unwrap_or(24);
    match unit {
        "s" | "sec" | "secs" => n,
        "m" | "min" | "mins" => n * 60,
        "h" | "hr" | "hour" | "hours" => n * 60 * 60,
        "d" | "day" | "days" => n * 60 * 60 * 24,
        _ => {
            tracing::warn!("Unrecognized token lifetime '{}', defaulting to 24h", input);
            24 * 60 * 60
        },
    }
}
