//! SIP Digest Authentication, client side (RFC 2617, RFC 3261 Section 22)
//!
//! Challenges come from `WWW-Authenticate` (401) and `Proxy-Authenticate`
//! (407). The [`AuthHelper`] turns a challenge plus cached credentials into
//! the value of the matching `Authorization`/`Proxy-Authorization` header.

use super::message::{SipHeaders, SipResponse};
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::SipMethod;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// User credentials for authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    pub username: String,
    pub password: Option<String>,
    /// Precomputed MD5(username:realm:password)
    pub ha1: Option<String>,
    /// Realm these credentials apply to; `None` matches any realm
    pub realm: Option<String>,
}

impl UserCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: Some(password.to_string()),
            ha1: None,
            realm: None,
        }
    }

    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = Some(realm.to_string());
        self
    }

    pub fn matches_realm(&self, realm: &str) -> bool {
        self.realm.as_deref().map_or(true, |r| r == realm)
    }
}

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
    /// Came from Proxy-Authenticate
    pub proxy: bool,
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate`/`Proxy-Authenticate` value
    pub fn parse(value: &str, proxy: bool) -> Result<Self, SipError> {
        let trimmed = value.trim();
        let scheme_end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        if !trimmed[..scheme_end].eq_ignore_ascii_case("Digest") {
            return Err(SipError::AuthFailure(format!(
                "Unsupported auth scheme: {}",
                &trimmed[..scheme_end]
            )));
        }
        let params = parse_digest_params(&trimmed[scheme_end..]);
        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::AuthFailure("Missing realm in challenge".to_string()))?;
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::AuthFailure("Missing nonce in challenge".to_string()))?;

        Ok(Self {
            realm: realm.clone(),
            nonce: nonce.clone(),
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
            stale: params
                .get("stale")
                .is_some_and(|s| s.eq_ignore_ascii_case("true")),
            proxy,
        })
    }

    /// All digest challenges of a 401/407 response
    pub fn from_response(response: &SipResponse) -> Vec<Self> {
        let mut challenges = Vec::new();
        for (name, proxy) in [("WWW-Authenticate", false), ("Proxy-Authenticate", true)] {
            for value in response.header_values(name) {
                match Self::parse(&value, proxy) {
                    Ok(challenge) => challenges.push(challenge),
                    Err(e) => debug!("Ignoring challenge {}: {}", value, e),
                }
            }
        }
        challenges
    }

    /// Header carrying the answer to this challenge
    pub fn authorization_header_name(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }

    /// Format as WWW-Authenticate header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest realm="{}", nonce="{}", algorithm={}"#,
            self.realm, self.nonce, self.algorithm
        );
        if let Some(qop) = &self.qop {
            value.push_str(&format!(r#", qop="{}""#, qop));
        }
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }

    /// `auth` when the server offers it
    fn selected_qop(&self) -> Option<&'static str> {
        self.qop.as_deref().and_then(|qop| {
            qop.split(',')
                .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                .then_some("auth")
        })
    }
}

/// Parse Digest authentication parameters
pub fn parse_digest_params(value: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let digest_str = value.trim();
    let digest_str = digest_str
        .strip_prefix("Digest ")
        .unwrap_or(digest_str)
        .trim();

    // split on commas outside quotes
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in digest_str.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }
    params
}

/// Credential computation for a challenge
#[cfg_attr(test, mockall::automock)]
pub trait AuthHelper: Send {
    /// Value of the Authorization/Proxy-Authorization header answering `challenge`
    fn compute_credentials(
        &mut self,
        challenge: &AuthChallenge,
        credentials: &UserCredentials,
        method: SipMethod,
        uri: &str,
    ) -> Result<String, SipError>;
}

/// MD5 digest helper
#[derive(Debug, Default)]
pub struct DigestAuthHelper {
    nonce_counts: HashMap<String, u32>,
}

impl DigestAuthHelper {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_cnonce() -> String {
        let mut rng = rand::thread_rng();
        let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
        hex::encode(random_bytes)
    }

    pub fn compute_ha1(username: &str, realm: &str, password: &str) -> String {
        format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)))
    }

    /// Calculate digest response
    pub fn calculate_response(
        ha1: &str,
        nonce: &str,
        method: &str,
        uri: &str,
        qop: Option<(&str, &str, &str)>,
    ) -> String {
        // HA2 = MD5(method:uri)
        let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

        // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
        let digest = match qop {
            Some((qop_value, nc, cnonce)) => md5::compute(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, nonce, nc, cnonce, qop_value, ha2
            )),
            None => md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)),
        };
        format!("{:x}", digest)
    }
}

impl AuthHelper for DigestAuthHelper {
    fn compute_credentials(
        &mut self,
        challenge: &AuthChallenge,
        credentials: &UserCredentials,
        method: SipMethod,
        uri: &str,
    ) -> Result<String, SipError> {
        if !challenge.algorithm.eq_ignore_ascii_case("MD5") {
            return Err(SipError::AuthFailure(format!(
                "Unsupported digest algorithm: {}",
                challenge.algorithm
            )));
        }
        let ha1 = match (&credentials.ha1, &credentials.password) {
            (Some(ha1), _) => ha1.clone(),
            (None, Some(password)) => {
                Self::compute_ha1(&credentials.username, &challenge.realm, password)
            }
            (None, None) => {
                return Err(SipError::AuthFailure(format!(
                    "No secret for user {}",
                    credentials.username
                )))
            }
        };

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}""#,
            credentials.username, challenge.realm, challenge.nonce, uri
        );
        let response = match challenge.selected_qop() {
            Some(qop) => {
                let count = self.nonce_counts.entry(challenge.nonce.clone()).or_insert(0);
                *count += 1;
                let nc = format!("{:08x}", count);
                let cnonce = Self::generate_cnonce();
                let response = Self::calculate_response(
                    &ha1,
                    &challenge.nonce,
                    method.as_str(),
                    uri,
                    Some((qop, &nc, &cnonce)),
                );
                value.push_str(&format!(
                    r#", response="{}", algorithm=MD5, qop={}, nc={}, cnonce="{}""#,
                    response, qop, nc, cnonce
                ));
                response
            }
            None => {
                let response =
                    Self::calculate_response(&ha1, &challenge.nonce, method.as_str(), uri, None);
                value.push_str(&format!(r#", response="{}", algorithm=MD5"#, response));
                response
            }
        };
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        debug!(
            "Computed digest response for user {}: {}",
            credentials.username, response
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Digest realm="atlanta.com", domain="sip:ss1.carrier.com", qop="auth,auth-int", nonce="f84f1cec41e6cbe5aea9c8e88d359", opaque="", stale=FALSE, algorithm=MD5"#,
            false,
        )
        .unwrap();

        assert_eq!(challenge.realm, "atlanta.com");
        assert_eq!(challenge.nonce, "f84f1cec41e6cbe5aea9c8e88d359");
        assert_eq!(challenge.qop.as_deref(), Some("auth,auth-int"));
        assert!(!challenge.stale);
        assert_eq!(challenge.authorization_header_name(), "Authorization");
        assert_eq!(challenge.selected_qop(), Some("auth"));
    }

    #[test]
    fn test_parse_rejects_basic() {
        assert!(matches!(
            AuthChallenge::parse(r#"Basic realm="x""#, false),
            Err(SipError::AuthFailure(_))
        ));
    }

    #[test]
    fn test_parse_digest_params() {
        let auth_value = r#"Digest username="alice", realm="test.com", nonce="abc123", uri="sip:bob@test.com", response="def456""#;
        let params = parse_digest_params(auth_value);

        assert_eq!(params.get("username").unwrap(), "alice");
        assert_eq!(params.get("realm").unwrap(), "test.com");
        assert_eq!(params.get("nonce").unwrap(), "abc123");
    }

    #[test]
    fn test_rfc2617_response_without_qop() {
        // RFC 2617 style vector computed for SIP
        let ha1 = DigestAuthHelper::compute_ha1("bob", "biloxi.com", "zanzibar");
        let response = DigestAuthHelper::calculate_response(
            &ha1,
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "REGISTER",
            "sip:biloxi.com",
            None,
        );
        assert_eq!(response.len(), 32);
        assert!(response.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compute_credentials_with_qop_counts_nonce() {
        let mut helper = DigestAuthHelper::new();
        let challenge = AuthChallenge {
            realm: "biloxi.com".to_string(),
            nonce: "n1".to_string(),
            algorithm: "MD5".to_string(),
            qop: Some("auth".to_string()),
            opaque: Some("op".to_string()),
            stale: false,
            proxy: true,
        };
        let creds = UserCredentials::new("bob", "zanzibar");

        let first = helper
            .compute_credentials(&challenge, &creds, SipMethod::Register, "sip:biloxi.com")
            .unwrap();
        let second = helper
            .compute_credentials(&challenge, &creds, SipMethod::Register, "sip:biloxi.com")
            .unwrap();

        let params = parse_digest_params(&first);
        assert_eq!(params.get("nc").unwrap(), "00000001");
        assert_eq!(params.get("opaque").unwrap(), "op");
        assert_eq!(params.get("username").unwrap(), "bob");
        assert_eq!(parse_digest_params(&second).get("nc").unwrap(), "00000002");
    }

    #[test]
    fn test_compute_credentials_needs_secret() {
        let mut helper = DigestAuthHelper::new();
        let challenge = AuthChallenge::parse(r#"Digest realm="r", nonce="n""#, false).unwrap();
        let creds = UserCredentials {
            username: "bob".to_string(),
            password: None,
            ha1: None,
            realm: None,
        };
        assert!(matches!(
            helper.compute_credentials(&challenge, &creds, SipMethod::Register, "sip:r"),
            Err(SipError::AuthFailure(_))
        ));
    }

    #[test]
    fn test_realm_matching() {
        let any = UserCredentials::new("bob", "pw");
        let scoped = UserCredentials::new("bob", "pw").with_realm("biloxi.com");
        assert!(any.matches_realm("anything"));
        assert!(scoped.matches_realm("biloxi.com"));
        assert!(!scoped.matches_realm("atlanta.com"));
    }
}
