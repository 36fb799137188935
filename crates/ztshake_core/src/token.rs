//! Session token issuance and verification.
//!
//! Each session gets a fresh Ed25519 keypair. The private key signs exactly
//! one compact JWS (`EdDSA`) and is dropped before [`TokenIssuer::issue`]
//! returns; only the public key is ever persisted. Verification pins the
//! algorithm to `EdDSA`, so a token whose header claims anything else is
//! rejected regardless of its signature.

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only algorithm tokens are signed and accepted with.
pub const TOKEN_ALGORITHM: Algorithm = Algorithm::EdDSA;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Token signing failed: {0}")]
    Signing(jsonwebtoken::errors::Error),

    #[error("Stored public key is unusable: {0}")]
    InvalidKey(jsonwebtoken::errors::Error),

    #[error("Unexpected verification failure: {0}")]
    Verification(jsonwebtoken::errors::Error),

    #[error("Malformed token: {0}")]
    Malformed(String),
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub session_id: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
}

/// Timing of a token to issue.
#[derive(Debug, Clone, Copy)]
pub struct IssueOptions {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
}

impl IssueOptions {
    /// Valid from now for `minutes`.
    pub fn expiring_in(minutes: i64) -> Self {
        let now = Utc::now();
        Self {
            issued_at: now,
            expires_at: now + Duration::minutes(minutes),
            not_before: None,
        }
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// A signed token and the public half of the key that signed it.
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    /// SPKI PEM.
    pub public_key: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub struct TokenIssuer;

impl TokenIssuer {
    /// Sign a token for `session_id` valid for `expiration_minutes`.
    pub fn issue(session_id: &str, expiration_minutes: i64) -> Result<IssuedToken, TokenError> {
        Self::issue_with(session_id, IssueOptions::expiring_in(expiration_minutes))
    }

    pub fn issue_with(session_id: &str, options: IssueOptions) -> Result<IssuedToken, TokenError> {
        // Generated per call, never reused; zeroized on drop.
        let signing_key = SigningKey::generate(&mut OsRng);
        let private_der = signing_key
            .to_pkcs8_der()
            .map_err(|e| TokenError::KeyGeneration(e.to_string()))?;
        let public_key = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| TokenError::KeyGeneration(e.to_string()))?;
        let encoding_key = EncodingKey::from_ed_der(private_der.as_bytes());

        let claims = SessionClaims {
            session_id: session_id.to_string(),
            iat: options.issued_at.timestamp(),
            exp: options.expires_at.timestamp(),
            nbf: options.not_before.map(|t| t.timestamp()),
        };
        let token = encode(&Header::new(TOKEN_ALGORITHM), &claims, &encoding_key)
            .map_err(TokenError::Signing)?;

        Ok(IssuedToken {
            token,
            public_key,
            expires_at: options.expires_at,
        })
    }
}

/// Result of verifying a token against a stored public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid(SessionClaims),
    Expired,
    SignatureInvalid,
    NotYetValid,
}

pub struct TokenVerifier;

impl TokenVerifier {
    /// Verify signature, algorithm, expiry and not-before.
    ///
    /// The three rejection kinds are returned as values. Anything else
    /// (unparseable stored key, crypto backend failure) is an `Err`.
    pub fn verify(token: &str, public_key: &str) -> Result<Verification, TokenError> {
        let key = DecodingKey::from_ed_pem(public_key.as_bytes()).map_err(TokenError::InvalidKey)?;

        let mut validation = Validation::new(TOKEN_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);

        match decode::<SessionClaims>(token, &key, &validation) {
            Ok(data) => Ok(Verification::Valid(data.claims)),
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature => Ok(Verification::Expired),
                ErrorKind::ImmatureSignature => Ok(Verification::NotYetValid),
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_)
                | ErrorKind::MissingRequiredClaim(_) => Ok(Verification::SignatureInvalid),
                _ => Err(TokenError::Verification(e)),
            },
        }
    }
}

#[derive(Deserialize)]
struct SessionIdClaim {
    session_id: String,
}

/// Extract the session identifier without verifying anything.
///
/// Used to locate the session's slot before its public key is known.
pub fn peek_session_id(token: &str) -> Result<String, TokenError> {
    let mut validation = Validation::new(TOKEN_ALGORITHM);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<SessionIdClaim>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| TokenError::Malformed(e.to_string()))?;

    let session_id = data.claims.session_id;
    if session_id.is_empty() || !session_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(TokenError::Malformed(format!(
            "invalid session identifier {:?}",
            session_id
        )));
    }
    Ok(session_id)
}
