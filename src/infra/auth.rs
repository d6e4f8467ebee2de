use async_trait::async_trait;

use crate::application::repos::{AuthProvider, Principal, Role};

/// Session fixed at construction time.
///
/// The operator binary acts with the configured service token; tests use it
/// to play an editor, a reader or an anonymous visitor.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    principal: Option<Principal>,
}

impl StaticAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
        }
    }

    /// An admin session for the given service token, if one is configured.
    pub fn service(token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.trim().is_empty() => Self::signed_in(Principal {
                user_id: "service".to_string(),
                role: Role::Admin,
                access_token: Some(token.to_string()),
            }),
            _ => Self::anonymous(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_principal(&self) -> Option<Principal> {
        self.principal.clone()
    }
}
