//! Pool tokens: the bearer credentials agents present to register and
//! connect.
//!
//! Tokens are HMAC-SHA256 based, scoped to one pool.
//! Format: `corral_pt_<pool_id>_<hmac_hex>`

pub mod guard;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify pool tokens.
const TOKEN_PREFIX: &str = "corral_pt_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("token secret is empty")]
    EmptySecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Parse a hex-encoded secret, as stored in the config file.
    pub fn from_hex(secret_hex: &str) -> Result<Self, TokenError> {
        let secret = hex::decode(secret_hex.trim())
            .map_err(|e| TokenError::InvalidFormat(format!("token secret is not valid hex: {e}")))?;
        if secret.is_empty() {
            return Err(TokenError::EmptySecret);
        }
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated pool token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolClaims {
    pub pool_id: String,
}

/// Issue the bearer token for a pool.
pub fn generate_pool_token(config: &TokenConfig, pool_id: &str) -> String {
    let mac = compute_hmac(&config.secret, pool_id.as_bytes());
    format!("{TOKEN_PREFIX}{pool_id}_{}", hex::encode(mac))
}

/// Validate a pool token and extract the pool it is scoped to.
///
/// Pool ids may contain underscores; the HMAC is always the last
/// underscore-separated component.
pub fn validate_pool_token(config: &TokenConfig, token: &str) -> Result<PoolClaims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with '{TOKEN_PREFIX}'"))
    })?;

    let (pool_id, hmac_hex) = rest.rsplit_once('_').ok_or_else(|| {
        TokenError::InvalidFormat("expected underscore between pool id and hmac".to_string())
    })?;
    if pool_id.is_empty() {
        return Err(TokenError::InvalidFormat("empty pool id".to_string()));
    }

    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    verify_hmac_constant_time(&config.secret, pool_id.as_bytes(), &provided_mac)?;

    Ok(PoolClaims {
        pool_id: pool_id.to_string(),
    })
}

/// Hex SHA-256 of a bearer, the only form in which bearers are stored.
pub fn hash_bearer(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC can take key of any size")
}

fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = new_mac(key);
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// `verify_slice` compares in constant time.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    expected_mac: &[u8],
) -> Result<(), TokenError> {
    let mut mac = new_mac(key);
    mac.update(message);
    mac.verify_slice(expected_mac)
        .map_err(|_| TokenError::HmacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TokenConfig {
        TokenConfig::new(b"test-secret-key-for-corral".to_vec())
    }

    #[test]
    fn generate_token_has_correct_format() {
        let token = generate_pool_token(&test_config(), "p1");
        assert!(token.starts_with("corral_pt_p1_"));
        let hmac_hex = token.rsplit_once('_').unwrap().1;
        assert_eq!(hmac_hex.len(), 64, "HMAC-SHA256 hex should be 64 chars");
    }

    #[test]
    fn generate_and_validate_roundtrip() {
        let config = test_config();
        let token = generate_pool_token(&config, "build-pool");
        let claims = validate_pool_token(&config, &token).unwrap();
        assert_eq!(claims.pool_id, "build-pool");
    }

    #[test]
    fn pool_ids_with_underscores_survive() {
        let config = test_config();
        let token = generate_pool_token(&config, "eu_west_1");
        assert_eq!(validate_pool_token(&config, &token).unwrap().pool_id, "eu_west_1");
    }

    #[test]
    fn reject_tampered_hmac() {
        let config = test_config();
        let mut tampered = generate_pool_token(&config, "p1");
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });

        assert!(matches!(
            validate_pool_token(&config, &tampered),
            Err(TokenError::HmacMismatch)
        ));
    }

    #[test]
    fn reject_token_moved_to_another_pool() {
        let config = test_config();
        let token = generate_pool_token(&config, "p1");
        let moved = token.replacen("corral_pt_p1_", "corral_pt_p2_", 1);
        assert!(matches!(
            validate_pool_token(&config, &moved),
            Err(TokenError::HmacMismatch)
        ));
    }

    #[test]
    fn reject_wrong_secret() {
        let token = generate_pool_token(&test_config(), "p1");
        let wrong = TokenConfig::new(b"wrong-secret".to_vec());
        assert!(matches!(
            validate_pool_token(&wrong, &token),
            Err(TokenError::HmacMismatch)
        ));
    }

    #[test]
    fn reject_malformed_tokens() {
        let config = test_config();
        for bad in ["", "wrong_prefix_abc", "corral_pt_nounderscore", "corral_pt__abcd", "corral_pt_p1_zz-not-hex"] {
            assert!(
                matches!(validate_pool_token(&config, bad), Err(TokenError::InvalidFormat(_))),
                "{bad:?} should be rejected as malformed"
            );
        }
    }

    #[test]
    fn from_hex_rejects_bad_secrets() {
        assert!(matches!(TokenConfig::from_hex("zz"), Err(TokenError::InvalidFormat(_))));
        assert!(matches!(TokenConfig::from_hex(""), Err(TokenError::EmptySecret)));
        assert_eq!(TokenConfig::from_hex("0a0b").unwrap().secret, vec![10, 11]);
    }

    #[test]
    fn bearer_hash_is_stable_hex() {
        let h = hash_bearer("corral_pt_p1_abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_bearer("corral_pt_p1_abc"));
        assert_ne!(h, hash_bearer("corral_pt_p1_abd"));
    }
}
