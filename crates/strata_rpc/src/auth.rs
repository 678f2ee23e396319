//! Pluggable login checks for the RPC surface.

use async_trait::async_trait;
use strata_common::StrataResult;

/// Passwords with this prefix carry a one-time code instead of a password.
pub const OTP_PREFIX: &str = "$otp$:";

/// Split a one-time code out of a password field.
pub fn parse_otp(password: &str) -> Option<&str> {
    password.strip_prefix(OTP_PREFIX)
}

/// Host hook for one-time-password logins and session handle minting.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// `Ok(false)` rejects the code; `Err` is reported to the client as-is.
    async fn validate_user_otp(&self, user: &str, otp: &str) -> StrataResult<bool>;

    /// Opaque handle for a new session. Must not repeat while the server lives.
    fn generate_handle(&self) -> String;
}

/// Rejects every one-time code; handles are random uuids.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAuthProvider;

#[async_trait]
impl AuthProvider for DefaultAuthProvider {
    async fn validate_user_otp(&self, _user: &str, _otp: &str) -> StrataResult<bool> {
        Ok(false)
    }

    fn generate_handle(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_otp() {
        assert_eq!(parse_otp("$otp$:123456"), Some("123456"));
        assert_eq!(parse_otp("$otp$:"), Some(""));
        assert_eq!(parse_otp("manager"), None);
        assert_eq!(parse_otp("x$otp$:1"), None);
    }

    #[tokio::test]
    async fn test_default_provider_rejects_otp() {
        let auth = DefaultAuthProvider;
        assert!(!auth.validate_user_otp("sys", "000000").await.unwrap());
    }

    #[test]
    fn test_default_handles_are_unique() {
        let auth = DefaultAuthProvider;
        let a = auth.generate_handle();
        let b = auth.generate_handle();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
