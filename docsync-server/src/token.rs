//! Session ids and session tokens.
//!
//! A token is `base64url(json payload)`, followed by `"." + base64url(HMAC)`
//! when sessions are signed. The payload holds `session_id`,
//! `session_expiry` (unix seconds) and optionally an lz4-compressed extra
//! payload (request headers and cookies, handler-supplied values).
//!
//! A signed session id is `<random>.<signature>`, so the id alone can be
//! checked without server-side state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::{Map, Value as JsonValue};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_ID_LENGTH: usize = 44;
pub const SESSION_ID_KEY: &str = "session_id";
pub const SESSION_EXPIRY_KEY: &str = "session_expiry";
const EXTRA_PAYLOAD_KEY: &str = "__docsync_lz4__";

pub type TokenPayload = Map<String, JsonValue>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no subprotocol header was provided")]
    MissingSubprotocol,
    #[error("malformed subprotocol header: {0}")]
    MalformedSubprotocol(String),
    #[error("token is malformed: {0}")]
    MalformedToken(String),
    #[error("token signature is not valid")]
    InvalidSignature,
    #[error("token is expired")]
    Expired,
    #[error("session id is not valid")]
    InvalidSessionId,
    #[error("origin {0} is not allowed")]
    OriginNotAllowed(String),
    #[error("signing sessions requires a secret key")]
    MissingSecret,
    #[error("extra payload may not contain '{0}'")]
    ReservedPayloadKey(String),
    #[error("a session id is required")]
    SessionIdRequired,
}

/// Random alphanumeric secret suitable for signing.
pub fn generate_secret_key() -> String {
    random_string(SESSION_ID_LENGTH)
}

fn random_string(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Signs and verifies ids and tokens with one secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Option<Vec<u8>>,
    signed: bool,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("signed", &self.signed)
            .finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: Option<&str>, signed: bool) -> Result<Self, AuthError> {
        if signed && secret.is_none() {
            return Err(AuthError::MissingSecret);
        }
        Ok(Self {
            secret: secret.map(|s| s.as_bytes().to_vec()),
            signed,
        })
    }

    pub fn unsigned() -> Self {
        Self {
            secret: None,
            signed: false,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn generate_session_id(&self) -> Result<String, AuthError> {
        let base = random_string(SESSION_ID_LENGTH);
        if !self.signed {
            return Ok(base);
        }
        let signature = self.signature(&base)?;
        Ok(format!("{base}.{signature}"))
    }

    /// Build a token for `session_id`. `extra` may not contain `session_id`.
    pub fn generate_token(
        &self,
        session_id: &str,
        extra: TokenPayload,
        expiration: Duration,
    ) -> Result<String, AuthError> {
        if extra.contains_key(SESSION_ID_KEY) {
            return Err(AuthError::ReservedPayloadKey(SESSION_ID_KEY.to_string()));
        }
        let mut payload = TokenPayload::new();
        payload.insert(SESSION_ID_KEY.into(), JsonValue::from(session_id));
        payload.insert(
            SESSION_EXPIRY_KEY.into(),
            JsonValue::from(unix_now() + expiration.as_secs()),
        );
        if !extra.is_empty() {
            let raw = serde_json::to_vec(&extra).map_err(|e| AuthError::MalformedToken(e.to_string()))?;
            let packed = lz4_flex::compress_prepend_size(&raw);
            payload.insert(EXTRA_PAYLOAD_KEY.into(), JsonValue::from(URL_SAFE_NO_PAD.encode(packed)));
        }
        let json = serde_json::to_vec(&payload).map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        let token = URL_SAFE_NO_PAD.encode(json);
        if !self.signed {
            return Ok(token);
        }
        let signature = self.signature(&token)?;
        Ok(format!("{token}.{signature}"))
    }

    /// Verify the token's signature and the session id inside it.
    pub fn check_token_signature(&self, token: &str) -> bool {
        if !self.signed {
            return true;
        }
        let Some((base, signature)) = token.split_once('.') else {
            return false;
        };
        if !self.verify(base, signature) {
            return false;
        }
        match get_session_id(token) {
            Ok(session_id) => self.check_session_id_signature(&session_id),
            Err(_) => false,
        }
    }

    pub fn check_session_id_signature(&self, session_id: &str) -> bool {
        if !self.signed {
            return true;
        }
        match session_id.split_once('.') {
            Some((base, signature)) => self.verify(base, signature),
            None => false,
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        let secret = self.secret.as_deref().ok_or(AuthError::MissingSecret)?;
        HmacSha256::new_from_slice(secret).map_err(|_| AuthError::MissingSecret)
    }

    fn signature(&self, message: &str) -> Result<String, AuthError> {
        let mut mac = self.mac()?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    /// Constant-time comparison of `signature` against the expected MAC.
    fn verify(&self, message: &str, signature: &str) -> bool {
        let Ok(expected) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(message.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn decode_base(token: &str) -> Result<TokenPayload, AuthError> {
    let base = token.split('.').next().unwrap_or_default();
    let bytes = URL_SAFE_NO_PAD
        .decode(base)
        .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::MalformedToken(e.to_string()))
}

/// Session id carried by a token. Does not verify the signature.
pub fn get_session_id(token: &str) -> Result<String, AuthError> {
    let payload = decode_base(token)?;
    payload
        .get(SESSION_ID_KEY)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| AuthError::MalformedToken("no session id".into()))
}

/// Expiry (unix seconds) carried by a token.
pub fn get_session_expiry(token: &str) -> Result<u64, AuthError> {
    decode_base(token)?
        .get(SESSION_EXPIRY_KEY)
        .and_then(JsonValue::as_u64)
        .ok_or_else(|| AuthError::MalformedToken("no session expiry".into()))
}

pub fn check_token_expiry(token: &str) -> Result<(), AuthError> {
    if unix_now() > get_session_expiry(token)? {
        return Err(AuthError::Expired);
    }
    Ok(())
}

/// Token payload without `session_id`, with the extra payload expanded.
pub fn get_token_payload(token: &str) -> Result<TokenPayload, AuthError> {
    let mut payload = decode_base(token)?;
    payload.remove(SESSION_ID_KEY);
    if let Some(packed) = payload.remove(EXTRA_PAYLOAD_KEY) {
        let packed = packed
            .as_str()
            .ok_or_else(|| AuthError::MalformedToken("extra payload is not a string".into()))?;
        let compressed = URL_SAFE_NO_PAD
            .decode(packed)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        let extra: TokenPayload =
            serde_json::from_slice(&raw).map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        payload.extend(extra);
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn signer(secret: &str) -> TokenSigner {
        TokenSigner::new(Some(secret), true).unwrap()
    }

    #[test]
    fn test_unsigned_session_id() {
        let id = TokenSigner::unsigned().generate_session_id().unwrap();
        assert_eq!(id.len(), SESSION_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_signed_session_id_verifies() {
        let s = signer("abc");
        let id = s.generate_session_id().unwrap();
        assert!(id.contains('.'));
        assert!(s.check_session_id_signature(&id));
        assert!(!signer("qrs").check_session_id_signature(&id));
        assert!(!s.check_session_id_signature("plain-id"));
    }

    #[test]
    fn test_token_signed_with_other_key_rejected() {
        let abc = signer("abc");
        let id = abc.generate_session_id().unwrap();
        let token = abc.generate_token(&id, TokenPayload::new(), HOUR).unwrap();
        assert!(abc.check_token_signature(&token));
        assert!(!signer("qrs").check_token_signature(&token));
    }

    #[test]
    fn test_unsigned_token_never_passes_signed_check() {
        let token = TokenSigner::unsigned()
            .generate_token("S1", TokenPayload::new(), HOUR)
            .unwrap();
        assert!(!signer("abc").check_token_signature(&token));
        assert!(TokenSigner::unsigned().check_token_signature(&token));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let s = signer("abc");
        let id = s.generate_session_id().unwrap();
        let token = s.generate_token(&id, TokenPayload::new(), HOUR).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged = TokenSigner::unsigned()
            .generate_token(&id, TokenPayload::new(), HOUR * 100)
            .unwrap();
        assert!(!s.check_token_signature(&format!("{forged}.{sig}")));
    }

    #[test]
    fn test_payload_roundtrip_with_extra() {
        let mut extra = TokenPayload::new();
        extra.insert("headers".into(), serde_json::json!({"user-agent": "test"}));
        let token = TokenSigner::unsigned().generate_token("S1", extra, HOUR).unwrap();
        assert_eq!(get_session_id(&token).unwrap(), "S1");
        let payload = get_token_payload(&token).unwrap();
        assert!(!payload.contains_key(SESSION_ID_KEY));
        assert_eq!(payload["headers"]["user-agent"], "test");
        assert!(payload.contains_key(SESSION_EXPIRY_KEY));
    }

    #[test]
    fn test_extra_payload_may_not_set_session_id() {
        let mut extra = TokenPayload::new();
        extra.insert(SESSION_ID_KEY.into(), JsonValue::from("evil"));
        assert_eq!(
            TokenSigner::unsigned().generate_token("S1", extra, HOUR),
            Err(AuthError::ReservedPayloadKey(SESSION_ID_KEY.into()))
        );
    }

    #[test]
    fn test_expiry() {
        let fresh = TokenSigner::unsigned().generate_token("S1", TokenPayload::new(), HOUR).unwrap();
        assert!(check_token_expiry(&fresh).is_ok());

        let mut payload = TokenPayload::new();
        payload.insert(SESSION_ID_KEY.into(), "S1".into());
        payload.insert(SESSION_EXPIRY_KEY.into(), 1u64.into());
        let stale = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        assert_eq!(check_token_expiry(&stale), Err(AuthError::Expired));
    }

    #[test]
    fn test_signing_requires_secret() {
        assert_eq!(TokenSigner::new(None, true).err(), Some(AuthError::MissingSecret));
    }

    #[test]
    fn test_garbage_token() {
        assert!(get_session_id("!!!").is_err());
        assert!(!signer("abc").check_token_signature("abc.def"));
    }
}
