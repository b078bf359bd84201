//! Bearer extraction for agent-facing endpoints.
//!
//! Registration and the control channel both carry the pool token as
//! `Authorization: Bearer <token>`.

/// Errors from bearer checks.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("missing Authorization header")]
    MissingHeader,

    #[error("Authorization header must use the Bearer scheme")]
    UnsupportedScheme,

    #[error("empty bearer token")]
    EmptyToken,
}

/// Extract the bearer from an `Authorization` header value.
///
/// The scheme is matched case-insensitively.
pub fn bearer_from_header(value: Option<&str>) -> Result<&str, GuardError> {
    let value = value.ok_or(GuardError::MissingHeader)?.trim_start();
    let (scheme, token) = value.split_once(' ').ok_or(GuardError::UnsupportedScheme)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(GuardError::UnsupportedScheme);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(GuardError::EmptyToken);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer() {
        assert_eq!(bearer_from_header(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer_from_header(Some("bearer   abc ")).unwrap(), "abc");
    }

    #[test]
    fn rejects_missing_or_foreign_schemes() {
        assert!(matches!(bearer_from_header(None), Err(GuardError::MissingHeader)));
        assert!(matches!(
            bearer_from_header(Some("Basic dXNlcjpwYXNz")),
            Err(GuardError::UnsupportedScheme)
        ));
        assert!(matches!(
            bearer_from_header(Some("Bearer")),
            Err(GuardError::UnsupportedScheme)
        ));
        assert!(matches!(bearer_from_header(Some("Bearer  ")), Err(GuardError::EmptyToken)));
    }
}
