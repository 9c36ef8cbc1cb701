//! Paid-stream access tokens.
//!
//! Access to streams with a fee attached is granted through stateless
//! RS256 JSON Web Tokens. The purchase API signs a token binding a
//! stream identifier to the purchase transaction; the edge server only
//! needs the public key to verify it.
//!
//! ## Example token
//!
//! ```json
//! {
//!   "sid": "what/6769855a9aa43b67086f9ff3c1a5bacb5698a27a",
//!   "txid": "c1a5bacb5698a27a6769855a9aa43b67",
//!   "exp": 4102324986,
//!   "iat": 1699734557
//! }
//! ```
//!
//! The `sid` claim must match the stream being requested; tokens are
//! not transferable between streams.
//!
//! Key material is RSA PEM (PKCS#1). Keys can be generated with:
//!
//! ```text
//! $ openssl genrsa -out privateKey.pem 2048
//! ```

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables)
)]

pub mod util;


use std::error::Error as StdError;

use chrono::{DateTime, Duration, Utc};
use displaydoc::Display;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub type TokenResult<T> = Result<T, Error>;

/// A token error.
#[derive(Debug, Display)]
pub enum Error {
    /// token is expired
    Expired,

    /// token signature could not be verified
    BadSignature,

    /// token is malformed: {0}
    Malformed(String),

    /// token was issued for a different stream
    StreamMismatch,

    /// invalid key material: {0}
    InvalidKey(String),
}

impl Error {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Expired => "Expired",
            Self::BadSignature => "BadSignature",
            Self::Malformed(_) => "Malformed",
            Self::StreamMismatch => "StreamMismatch",
            Self::InvalidKey(_) => "InvalidKey",
        }
    }
}

impl StdError for Error {}

/// Claims of a paid-stream token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamClaims {
    /// The stream this token grants access to.
    #[serde(rename = "sid")]
    pub stream_id: String,

    /// The purchase transaction.
    #[serde(rename = "txid")]
    pub transaction_id: String,

    /// Expiry as Unix time.
    #[serde(rename = "exp")]
    pub expires_at: i64,

    /// Issuance time as Unix time.
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
}

/// A validated paid-stream token.
#[derive(Debug)]
pub struct StreamToken(StreamClaims);

impl StreamToken {
    pub fn stream_id(&self) -> &str {
        &self.0.stream_id
    }

    pub fn transaction_id(&self) -> &str {
        &self.0.transaction_id
    }

    pub fn expires_at(&self) -> i64 {
        self.0.expires_at
    }
}

/// Verifies paid-stream tokens against an RSA public key.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Creates a verifier from a PEM-encoded RSA public key.
    pub fn from_public_key_pem(pem: &[u8]) -> TokenResult<Self> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(|e| Error::InvalidKey(e.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self { key, validation })
    }

    /// Verifies a token and checks that it was issued for `stream_id`.
    pub fn verify(&self, jwt: &str, stream_id: &str) -> TokenResult<StreamToken> {
        let data = jsonwebtoken::decode::<StreamClaims>(jwt, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => Error::Expired,
                JwtErrorKind::InvalidSignature
                | JwtErrorKind::InvalidAlgorithm
                | JwtErrorKind::InvalidAlgorithmName => Error::BadSignature,
                _ => Error::Malformed(e.to_string()),
            })?;

        if data.claims.stream_id != stream_id {
            tracing::debug!(
                expected = stream_id,
                got = %data.claims.stream_id,
                "token stream binding mismatch"
            );
            return Err(Error::StreamMismatch);
        }

        Ok(StreamToken(data.claims))
    }
}

/// Signs paid-stream tokens with an RSA private key.
pub struct TokenSigner {
    key: EncodingKey,
}

impl TokenSigner {
    /// Creates a signer from a PEM-encoded RSA private key.
    pub fn from_private_key_pem(pem: &[u8]) -> TokenResult<Self> {
        let key = EncodingKey::from_rsa_pem(pem).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Creates a signed token for a stream purchase.
    pub fn create_token(
        &self,
        stream_id: &str,
        transaction_id: &str,
        expires_at: DateTime<Utc>,
    ) -> TokenResult<String> {
        let claims = StreamClaims {
            stream_id: stream_id.to_owned(),
            transaction_id: transaction_id.to_owned(),
            expires_at: expires_at.timestamp(),
            issued_at: Some(Utc::now().timestamp()),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| Error::Malformed(e.to_string()))
    }
}

/// Token validity of ten seconds per hundred megabytes of stream size.
///
/// Matches the expiry policy of the purchase API so locally-issued
/// tokens behave the same as production ones.
pub fn expiry_for_size(stream_size: u64) -> DateTime<Utc> {
    let seconds = (stream_size / (100 * 1024 * 1024) + 1) * 10;
    Utc::now() + Duration::seconds(seconds as i64)
}
