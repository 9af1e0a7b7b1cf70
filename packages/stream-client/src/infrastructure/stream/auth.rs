//! Private Channel Authentication
//!
//! Keyed-hash signing for authenticated channels. Two schemes are
//! supported:
//!
//! ## Per-request signatures
//! Every private subscribe/unsubscribe request carries a signature over
//! `channel={channel}&event={op}&time={ts}`.
//!
//! ## Login frame
//! 1. Connect to the endpoint
//! 2. Send `{"op":"login","args":[{"apiKey":..,"passphrase":..,"timestamp":..,"sign":..}]}`
//!    with `sign` computed over `{ts}GET/users/self/verify`
//! 3. Optionally wait for `{"event":"login","code":"0"}` before replaying
//!    subscriptions, bounded by the login timeout
//!
//! Signatures use HMAC-SHA256 or HMAC-SHA512, encoded as hex or base64.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Sha256, Sha512};
use thiserror::Error;

use crate::domain::subscription::SubscriptionOp;
use crate::infrastructure::config::Credentials;

/// Canonical request path signed by the login scheme.
const LOGIN_VERIFY_PATH: &str = "GET/users/self/verify";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No credentials configured.
    #[error("credentials are required for authenticated channels")]
    MissingCredentials,

    /// Secret cannot be used as an HMAC key.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    /// Server rejected the login.
    #[error("login rejected ({code}): {message}")]
    Rejected {
        /// Error code from server.
        code: String,
        /// Error message from server.
        message: String,
    },

    /// No acknowledgement within the login timeout.
    #[error("login not acknowledged within {0:?}")]
    Timeout(Duration),

    /// Connection was replaced before the acknowledgement arrived.
    #[error("connection lost while awaiting login acknowledgement")]
    Interrupted,

    /// Login request could not be encoded.
    #[error("failed to encode login request: {0}")]
    Encode(String),
}

// =============================================================================
// Scheme
// =============================================================================

/// Hash function for HMAC signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    /// HMAC-SHA256.
    #[default]
    Sha256,
    /// HMAC-SHA512.
    Sha512,
}

/// Text encoding of the signature bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureEncoding {
    /// Lowercase hex.
    #[default]
    Hex,
    /// Standard base64 with padding.
    Base64,
}

/// When credentials are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Sign each private subscribe/unsubscribe request.
    PerRequest,
    /// Send one login frame per connection before replay.
    LoginFrame {
        /// Wait for the login acknowledgement before replaying subscriptions.
        await_ack: bool,
    },
}

/// What to do when login fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthFailurePolicy {
    /// Report the error and keep the connection (public channels still work).
    #[default]
    Report,
    /// Report the error and tear the connection down for a fresh attempt.
    Reconnect,
}

/// HMAC authentication strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HmacAuth {
    algorithm: HashAlgorithm,
    encoding: SignatureEncoding,
    mode: AuthMode,
    on_failure: AuthFailurePolicy,
}

impl HmacAuth {
    /// Sign each private request.
    #[must_use]
    pub const fn per_request(algorithm: HashAlgorithm, encoding: SignatureEncoding) -> Self {
        Self {
            algorithm,
            encoding,
            mode: AuthMode::PerRequest,
            on_failure: AuthFailurePolicy::Report,
        }
    }

    /// Log in once per connection.
    #[must_use]
    pub const fn login_frame(
        algorithm: HashAlgorithm,
        encoding: SignatureEncoding,
        await_ack: bool,
    ) -> Self {
        Self {
            algorithm,
            encoding,
            mode: AuthMode::LoginFrame { await_ack },
            on_failure: AuthFailurePolicy::Report,
        }
    }

    /// Set the login failure policy.
    #[must_use]
    pub const fn with_failure_policy(mut self, policy: AuthFailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    /// Scheme in use.
    #[must_use]
    pub const fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Login failure policy.
    #[must_use]
    pub const fn failure_policy(&self) -> AuthFailurePolicy {
        self.on_failure
    }

    /// Check if replay waits for the login acknowledgement.
    #[must_use]
    pub const fn awaits_ack(&self) -> bool {
        matches!(self.mode, AuthMode::LoginFrame { await_ack: true })
    }

    /// Sign a message with the shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKey`] if the secret is rejected as a key.
    pub fn sign(&self, secret: &str, message: &str) -> Result<String, AuthError> {
        let digest = match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                    .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            HashAlgorithm::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
                    .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
                mac.update(message.as_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        };

        Ok(match self.encoding {
            SignatureEncoding::Hex => hex::encode(digest),
            SignatureEncoding::Base64 => STANDARD.encode(digest),
        })
    }

    /// Signature for a private subscribe/unsubscribe request.
    ///
    /// Returns `None` when the scheme authenticates with a login frame.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn request_signature(
        &self,
        credentials: &Credentials,
        channel: &str,
        op: SubscriptionOp,
        timestamp: i64,
    ) -> Result<Option<String>, AuthError> {
        if self.mode != AuthMode::PerRequest {
            return Ok(None);
        }

        let message = format!("channel={channel}&event={}&time={timestamp}", op.as_str());
        self.sign(credentials.api_secret(), &message).map(Some)
    }

    /// Login frame for a new connection.
    ///
    /// Returns `None` when the scheme signs each request instead.
    ///
    /// # Errors
    ///
    /// Returns an error if signing or encoding fails.
    pub fn login_request(
        &self,
        credentials: &Credentials,
        timestamp: i64,
    ) -> Result<Option<String>, AuthError> {
        if !matches!(self.mode, AuthMode::LoginFrame { .. }) {
            return Ok(None);
        }

        let timestamp = timestamp.to_string();
        let sign = self.sign(
            credentials.api_secret(),
            &format!("{timestamp}{LOGIN_VERIFY_PATH}"),
        )?;

        let request = LoginRequest {
            op: "login",
            args: [LoginArgs {
                api_key: credentials.api_key(),
                passphrase: credentials.passphrase(),
                timestamp,
                sign,
            }],
        };

        serde_json::to_string(&request)
            .map(Some)
            .map_err(|e| AuthError::Encode(e.to_string()))
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    op: &'static str,
    args: [LoginArgs<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginArgs<'a> {
    api_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    passphrase: Option<&'a str>,
    timestamp: String,
    sign: String,
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use test_case::test_case;

    use super::*;

    const FOX: &str = "The quick brown fox jumps over the lazy dog";

    #[test_case(
        HashAlgorithm::Sha256,
        "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        ; "sha256"
    )]
    #[test_case(
        HashAlgorithm::Sha512,
        "b42af09057bac1e2d41708e48a902e09b5ff7f12ab428a4fe86653c73dd248fb82f948a549f7b791a5b41915ee4d1ec3935357e4e2317250d0372afa2ebeeb3a"
        ; "sha512"
    )]
    fn known_hex_vectors(algorithm: HashAlgorithm, expected: &str) {
        let auth = HmacAuth::per_request(algorithm, SignatureEncoding::Hex);
        assert_eq!(auth.sign("key", FOX).unwrap(), expected);
    }

    #[test]
    fn base64_matches_hex_digest() {
        let hex_sig = HmacAuth::per_request(HashAlgorithm::Sha256, SignatureEncoding::Hex)
            .sign("key", FOX)
            .unwrap();
        let b64_sig = HmacAuth::per_request(HashAlgorithm::Sha256, SignatureEncoding::Base64)
            .sign("key", FOX)
            .unwrap();

        assert_eq!(STANDARD.decode(b64_sig).unwrap(), hex::decode(hex_sig).unwrap());
    }

    #[test]
    fn per_request_signature_canonical_string() {
        let auth = HmacAuth::per_request(HashAlgorithm::Sha512, SignatureEncoding::Hex);
        let creds = Credentials::new("k", "s");

        let signature = auth
            .request_signature(&creds, "spot.orders", SubscriptionOp::Subscribe, 1_700_000_000)
            .unwrap()
            .unwrap();
        let expected = auth
            .sign("s", "channel=spot.orders&event=subscribe&time=1700000000")
            .unwrap();

        assert_eq!(signature, expected);
        assert!(auth.login_request(&creds, 1).unwrap().is_none());
    }

    #[test]
    fn login_frame_shape() {
        let auth = HmacAuth::login_frame(HashAlgorithm::Sha256, SignatureEncoding::Base64, true);
        let creds = Credentials::new("api-key", "secret").with_passphrase("phrase");

        let frame = auth.login_request(&creds, 1_538_054_050).unwrap().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        let expected_sign = auth.sign("secret", "1538054050GET/users/self/verify").unwrap();

        assert_eq!(
            value,
            json!({
                "op": "login",
                "args": [{
                    "apiKey": "api-key",
                    "passphrase": "phrase",
                    "timestamp": "1538054050",
                    "sign": expected_sign,
                }]
            })
        );
        assert!(auth.awaits_ack());
        assert!(
            auth.request_signature(&creds, "orders", SubscriptionOp::Subscribe, 1)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn login_frame_omits_missing_passphrase() {
        let auth = HmacAuth::login_frame(HashAlgorithm::Sha256, SignatureEncoding::Hex, false);
        let frame = auth
            .login_request(&Credentials::new("k", "s"), 1)
            .unwrap()
            .unwrap();

        assert!(!frame.contains("passphrase"));
        assert!(!auth.awaits_ack());
    }

    #[test]
    fn failure_policy_defaults_to_report() {
        let auth = HmacAuth::per_request(HashAlgorithm::Sha256, SignatureEncoding::Hex);
        assert_eq!(auth.failure_policy(), AuthFailurePolicy::Report);
        assert_eq!(
            auth.with_failure_policy(AuthFailurePolicy::Reconnect)
                .failure_policy(),
            AuthFailurePolicy::Reconnect
        );
    }
}
