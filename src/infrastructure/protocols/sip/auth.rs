//! SIP Digest Authentication, client side (RFC 2617, RFC 3261 §22, RFC 8760)

use super::message::{MessageKind, ParsedMessage};
use md5::compute as md5_compute;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Nonce count sent with qop=auth. Each challenge is answered once.
pub const NONCE_COUNT: &str = "00000001";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Response carries no digest challenge")]
    MissingChallenge,

    #[error("Challenge is missing required field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Credentials rejected")]
    Rejected,

    #[error("No challenge on file")]
    NoChallenge,
}

/// Who issued the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOrigin {
    /// 401 with WWW-Authenticate
    Server,
    /// 407 with Proxy-Authenticate
    Proxy,
}

impl ChallengeOrigin {
    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeOrigin::Server => "WWW-Authenticate",
            ChallengeOrigin::Proxy => "Proxy-Authenticate",
        }
    }

    pub fn authorization_header(&self) -> &'static str {
        match self {
            ChallengeOrigin::Server => "Authorization",
            ChallengeOrigin::Proxy => "Proxy-Authorization",
        }
    }
}

/// Hash function named by the challenge's `algorithm` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    pub fn parse(name: &str) -> Result<Self, AuthError> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            _ => Err(AuthError::UnsupportedAlgorithm(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    /// Lowercase hex digest of `input`
    pub fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5_compute(input)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub origin: ChallengeOrigin,
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` / `Proxy-Authenticate` value
    pub fn parse(origin: ChallengeOrigin, value: &str) -> Result<Self, AuthError> {
        let value = value.trim();
        let params = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => return Err(AuthError::MissingChallenge),
        };
        let mut params = parse_digest_params(params);

        let realm = params
            .remove("realm")
            .ok_or(AuthError::MissingField("realm"))?;
        let nonce = params
            .remove("nonce")
            .ok_or(AuthError::MissingField("nonce"))?;

        Ok(Self {
            origin,
            realm,
            nonce,
            algorithm: params
                .remove("algorithm")
                .unwrap_or_else(|| DigestAlgorithm::Md5.as_str().to_string()),
            qop: params.remove("qop"),
            opaque: params.remove("opaque"),
        })
    }

    pub fn digest_algorithm(&self) -> Result<DigestAlgorithm, AuthError> {
        DigestAlgorithm::parse(&self.algorithm)
    }

    /// The server offers qop=auth (possibly among others)
    pub fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Split `key=value, key="quoted, value"` pairs, honoring quotes
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, ch) in input.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim().trim_matches('"');
            params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        }
    }
    params
}

/// Pull the challenge out of a 401/407 response
pub fn ingest_challenge(message: &ParsedMessage) -> Result<AuthChallenge, AuthError> {
    let origin = match message.kind {
        MessageKind::Unauthorized => ChallengeOrigin::Server,
        MessageKind::ProxyAuthRequired => ChallengeOrigin::Proxy,
        _ => return Err(AuthError::MissingChallenge),
    };
    let value = message
        .header(origin.challenge_header())
        .ok_or(AuthError::MissingChallenge)?;

    let challenge = AuthChallenge::parse(origin, value)?;
    debug!(
        "Ingested {} challenge: realm={}, algorithm={}, qop={:?}",
        origin.challenge_header(),
        challenge.realm,
        challenge.algorithm,
        challenge.qop
    );
    Ok(challenge)
}

fn hashes(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &AuthChallenge,
) -> Result<(DigestAlgorithm, String, String), AuthError> {
    let algorithm = challenge.digest_algorithm()?;
    let ha1 = algorithm.hash(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
    Ok((algorithm, ha1, ha2))
}

/// Digest response without qop: `H(HA1:nonce:HA2)`
pub fn compute_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &AuthChallenge,
) -> Result<String, AuthError> {
    let (algorithm, ha1, ha2) = hashes(username, password, method, uri, challenge)?;
    Ok(algorithm.hash(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)))
}

/// Digest response with qop=auth: `H(HA1:nonce:nc:cnonce:auth:HA2)`
pub fn compute_qop_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &AuthChallenge,
    nc: &str,
    cnonce: &str,
) -> Result<String, AuthError> {
    let (algorithm, ha1, ha2) = hashes(username, password, method, uri, challenge)?;
    Ok(algorithm.hash(&format!(
        "{}:{}:{}:{}:auth:{}",
        ha1, challenge.nonce, nc, cnonce, ha2
    )))
}

fn generate_cnonce() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Full `Authorization` / `Proxy-Authorization` value answering `challenge`.
///
/// Uses qop=auth with a fresh cnonce when the server offers it.
pub fn authorization_value(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &AuthChallenge,
) -> Result<String, AuthError> {
    let algorithm = challenge.digest_algorithm()?;

    let mut value = if challenge.offers_auth_qop() {
        let cnonce = generate_cnonce();
        let response =
            compute_qop_response(username, password, method, uri, challenge, NONCE_COUNT, &cnonce)?;
        format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}, qop=auth, nc={}, cnonce="{}""#,
            username,
            challenge.realm,
            challenge.nonce,
            uri,
            response,
            algorithm.as_str(),
            NONCE_COUNT,
            cnonce
        )
    } else {
        let response = compute_response(username, password, method, uri, challenge)?;
        format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            username,
            challenge.realm,
            challenge.nonce,
            uri,
            response,
            algorithm.as_str()
        )
    };

    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    Ok(value)
}
