//! Signed connect URL for the WebSocket API.
//!
//! The API authenticates a connection by an HS256 JWT passed as the `jwt`
//! query parameter. Tokens are short-lived, so a fresh one is minted for
//! every attempt.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::common::error::{SocketError, SocketResult};
use crate::config::SocketSettings;

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime in seconds.
const TOKEN_TTL_SECS: i64 = 300;
/// Clock skew allowance for `nbf` and `iat`.
const CLOCK_SKEW_SECS: i64 = 60;
const REGION: &str = "ny";

#[derive(Debug, Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    kid: &'a str,
    exp: i64,
    nbf: i64,
    iat: i64,
    region: &'static str,
    method: &'static str,
    path: &'a str,
    host: &'a str,
    client_id: &'a str,
    nonce: &'a str,
    connection_expiry: i64,
}

/// API credentials with the secret already decoded.
#[derive(Clone)]
pub struct Credentials {
    client_id: String,
    secret: Vec<u8>,
    api_host: String,
    api_uri: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("api_host", &self.api_host)
            .field("api_uri", &self.api_uri)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(
        client_id: impl Into<String>,
        hex_secret: &str,
        api_host: impl Into<String>,
        api_uri: impl Into<String>,
    ) -> SocketResult<Self> {
        let secret = hex::decode(hex_secret.trim()).map_err(|e| SocketError::Auth {
            message: format!("client secret is not valid hex: {}", e),
        })?;
        Ok(Self {
            client_id: client_id.into(),
            secret,
            api_host: api_host.into(),
            api_uri: api_uri.into(),
        })
    }

    pub fn from_settings(settings: &SocketSettings) -> SocketResult<Self> {
        Self::new(
            settings.client_id.clone(),
            &settings.client_secret,
            settings.api_host.clone(),
            settings.api_uri.clone(),
        )
    }

    /// Endpoint without the token, for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.api_host, self.api_uri)
    }
}

fn encode_json<T: Serialize>(value: &T) -> SocketResult<String> {
    let json = serde_json::to_vec(value).map_err(|e| SocketError::Auth {
        message: e.to_string(),
    })?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn sign(secret: &[u8], data: &[u8]) -> SocketResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| SocketError::Auth {
        message: e.to_string(),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a signed token as of `now` (unix seconds).
pub fn build_token(credentials: &Credentials, now: i64, nonce: &str) -> SocketResult<String> {
    let header = encode_json(&Header {
        alg: "HS256",
        typ: "JWT",
    })?;
    let claims = encode_json(&Claims {
        iss: &credentials.client_id,
        kid: &credentials.client_id,
        exp: now + TOKEN_TTL_SECS,
        nbf: now - CLOCK_SKEW_SECS,
        iat: now - CLOCK_SKEW_SECS,
        region: REGION,
        method: "GET",
        path: &credentials.api_uri,
        host: &credentials.api_host,
        client_id: &credentials.client_id,
        nonce,
        connection_expiry: now + TOKEN_TTL_SECS,
    })?;

    let signing_input = format!("{}.{}", header, claims);
    let signature = sign(&credentials.secret, signing_input.as_bytes())?;
    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature)
    ))
}

/// Fresh connect URL: `api_host + api_uri + "?jwt=" + token`.
pub fn connect_url(credentials: &Credentials) -> SocketResult<String> {
    let now = chrono::Utc::now().timestamp();
    let nonce = uuid::Uuid::new_v4().to_string();
    let token = build_token(credentials, now, &nonce)?;
    Ok(format!("{}?jwt={}", credentials.endpoint(), token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn credentials() -> Credentials {
        Credentials::new("client-1", "00112233445566778899aabbccddeeff", "wss://api.example.com", "/v1/stream")
            .unwrap()
    }

    fn decode_segment(segment: &str) -> serde_json::Value {
        let bytes = URL_SAFE_NO_PAD.decode(segment).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        // RFC 4231 test case 2
        let mac = sign(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            mac,
            hex!("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
        );
    }

    #[test]
    fn test_token_header_and_claims() {
        let token = build_token(&credentials(), 1_700_000_000, "nonce-1").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(!token.contains('='));

        let header = decode_segment(parts[0]);
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["typ"], "JWT");

        let claims = decode_segment(parts[1]);
        assert_eq!(claims["iss"], "client-1");
        assert_eq!(claims["kid"], "client-1");
        assert_eq!(claims["client_id"], "client-1");
        assert_eq!(claims["exp"], 1_700_000_300i64);
        assert_eq!(claims["nbf"], 1_699_999_940i64);
        assert_eq!(claims["iat"], 1_699_999_940i64);
        assert_eq!(claims["connection_expiry"], 1_700_000_300i64);
        assert_eq!(claims["method"], "GET");
        assert_eq!(claims["path"], "/v1/stream");
        assert_eq!(claims["host"], "wss://api.example.com");
        assert_eq!(claims["region"], "ny");
        assert_eq!(claims["nonce"], "nonce-1");
    }

    #[test]
    fn test_signature_covers_header_and_claims() {
        let creds = credentials();
        let token = build_token(&creds, 1_700_000_000, "n").unwrap();
        let (signing_input, signature) = token.rsplit_once('.').unwrap();

        let expected = sign(&creds.secret, signing_input.as_bytes()).unwrap();
        assert_eq!(URL_SAFE_NO_PAD.decode(signature).unwrap(), expected);
    }

    #[test]
    fn test_connect_url_layout() {
        let url = connect_url(&credentials()).unwrap();
        let (endpoint, token) = url.split_once("?jwt=").unwrap();
        assert_eq!(endpoint, "wss://api.example.com/v1/stream");
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn test_each_url_has_a_fresh_nonce() {
        let creds = credentials();
        assert_ne!(connect_url(&creds).unwrap(), connect_url(&creds).unwrap());
    }

    #[test]
    fn test_non_hex_secret_is_rejected() {
        let err = Credentials::new("id", "zz", "wss://h", "/p").unwrap_err();
        assert!(matches!(err, SocketError::Auth { .. }));
    }
}
