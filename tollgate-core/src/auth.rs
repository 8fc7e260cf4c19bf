//! Bearer token verification.
//!
//! Verifies JWTs against the gateway's key material and turns the claims into
//! a [`Principal`]. Verification is pure: no I/O and no side effects. Failed
//! verifications do not feed the IP block guard; only backend login
//! responses do.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

/// Role given to requests that carry no credentials.
pub const PUBLIC_ROLE: &str = "public";

/// Identity reserved for anonymous principals.
pub const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Token verification errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// No credentials supplied. The caller becomes an anonymous principal.
    #[error("No bearer token supplied")]
    Missing,
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Token expired")]
    Expired,
    #[error("Token signature invalid")]
    SignatureInvalid,
}

/// Errors building a verifier from configuration.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Token secret must not be empty")]
    EmptySecret,
    #[error("Invalid key material: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),
}

/// The identity attached to a request after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub identity: String,
    pub role: String,
    pub authenticated: bool,
}

impl Principal {
    /// The principal for a request without credentials.
    pub fn anonymous() -> Self {
        Self {
            identity: ANONYMOUS_IDENTITY.to_string(),
            role: PUBLIC_ROLE.to_string(),
            authenticated: false,
        }
    }

    pub fn authenticated(identity: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            role: role.into(),
            authenticated: true,
        }
    }

    /// True if `allowed` is empty or contains this principal's role.
    pub fn is_role_allowed(&self, allowed: &BTreeSet<String>) -> bool {
        allowed.is_empty() || allowed.contains(&self.role)
    }
}

/// Claims the gateway reads from a token. Anything else is ignored.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    username: Option<String>,
    role: String,
    #[allow(dead_code)]
    exp: u64,
}

/// Verifies bearer tokens. Read-only after construction.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier {
    /// Build a verifier for `algorithm` (e.g. `HS256`, `RS256`).
    ///
    /// For HMAC algorithms `key` is the shared secret; for RSA and EC
    /// algorithms it is a PEM-encoded public key.
    pub fn new(algorithm: &str, key: &str) -> Result<Self, KeyError> {
        let alg = Algorithm::from_str(algorithm.trim())
            .map_err(|_| KeyError::UnsupportedAlgorithm(algorithm.to_string()))?;

        let key = match alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                if key.is_empty() {
                    return Err(KeyError::EmptySecret);
                }
                DecodingKey::from_secret(key.as_bytes())
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => DecodingKey::from_rsa_pem(key.as_bytes())?,
            Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(key.as_bytes())?,
            Algorithm::EdDSA => DecodingKey::from_ed_pem(key.as_bytes())?,
        };

        let mut validation = Validation::new(alg);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self { key, validation })
    }

    /// Shorthand for an HS256 verifier.
    pub fn hs256(secret: &str) -> Result<Self, KeyError> {
        Self::new("HS256", secret)
    }

    /// Require the `iss` claim to equal `issuer`.
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Tolerated clock skew for `exp`, in seconds.
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.validation.leeway = secs;
        self
    }

    /// Verify a raw token (without the `Bearer ` prefix).
    pub fn verify(&self, raw_token: &str) -> Result<Principal, VerificationError> {
        let raw_token = raw_token.trim();
        if raw_token.is_empty() {
            return Err(VerificationError::Missing);
        }

        let data = decode::<Claims>(raw_token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => VerificationError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    VerificationError::SignatureInvalid
                }
                _ => VerificationError::Malformed(e.to_string()),
            }
        })?;

        let claims = data.claims;
        let identity = claims
            .username
            .filter(|u| !u.is_empty())
            .or(claims.sub.filter(|s| !s.is_empty()))
            .ok_or_else(|| VerificationError::Malformed("token has no subject".to_string()))?;

        if claims.role.trim().is_empty() {
            return Err(VerificationError::Malformed("token has an empty role".to_string()));
        }

        Ok(Principal::authenticated(identity, claims.role))
    }

    /// Verify an `Authorization` header value.
    ///
    /// `None` (no header) yields [`VerificationError::Missing`]. Any scheme
    /// other than `Bearer` is malformed.
    pub fn verify_header(&self, header: Option<&str>) -> Result<Principal, VerificationError> {
        let Some(header) = header else {
            return Err(VerificationError::Missing);
        };

        let header = header.trim();
        if header.is_empty() {
            return Err(VerificationError::Missing);
        }

        let (scheme, token) = header
            .split_once(' ')
            .ok_or_else(|| VerificationError::Malformed("expected 'Bearer <token>'".to_string()))?;

        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(VerificationError::Malformed(format!(
                "unsupported authorization scheme '{}'",
                scheme
            )));
        }

        if token.trim().is_empty() {
            return Err(VerificationError::Malformed("empty bearer token".to_string()));
        }

        self.verify(token)
    }

    /// Resolve the principal for a request: missing credentials become the
    /// anonymous principal, every other failure is returned.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Principal, VerificationError> {
        match self.verify_header(header) {
            Err(VerificationError::Missing) => Ok(Principal::anonymous()),
            other => other,
        }
    }
}
