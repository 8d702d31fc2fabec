//! Authentication seam.
//!
//! Token issuance and verification live outside this crate; routes only need
//! a way to turn a bearer token into a [`CurrentUser`]. Wire a real JWT
//! verifier in production and [`test::StaticAuthenticator`] in tests.

use crate::error::{CountdeckError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The authenticated caller of a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentUser {
    /// Stable user id.
    pub id: String,
    /// Email address.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Whether the user may perform admin operations (plan creation).
    pub is_admin: bool,
}

/// Trait for resolving bearer tokens to users.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token to a user.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` for missing, expired, or malformed tokens.
    async fn authenticate(&self, token: &str) -> Result<CurrentUser>;
}

/// Extract the bearer token from an `Authorization` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CountdeckError::Unauthorized("Missing bearer token".to_string()))
}

/// Static authenticator for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::RwLock;

    /// Maps fixed tokens to users.
    #[derive(Default)]
    pub struct StaticAuthenticator {
        users: RwLock<HashMap<String, CurrentUser>>,
    }

    impl StaticAuthenticator {
        /// Create an empty authenticator.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a token for a user.
        pub fn add_user(&self, token: &str, user: CurrentUser) {
            self.users
                .write()
                .unwrap()
                .insert(token.to_string(), user);
        }
    }

    #[async_trait]
    impl Authenticator for StaticAuthenticator {
        async fn authenticate(&self, token: &str) -> Result<CurrentUser> {
            self.users
                .read()
                .unwrap()
                .get(token)
                .cloned()
                .ok_or_else(|| CountdeckError::Unauthorized("Invalid token".to_string()))
        }
    }
}
