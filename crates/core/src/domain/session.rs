use serde::{Deserialize, Serialize};

use crate::errors::ApplicationError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Portfolio company every row is scoped to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// Caller identity handed to each store explicitly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub user_id: Option<UserId>,
    pub tenant_id: Option<TenantId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedSession {
    pub user_id: UserId,
    pub tenant_id: TenantId,
}

impl Session {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self { user_id: Some(UserId(user_id.into())), tenant_id: Some(TenantId(tenant_id.into())) }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn require(&self) -> Result<AuthenticatedSession, ApplicationError> {
        let user_id = self
            .user_id
            .clone()
            .filter(|id| !id.0.trim().is_empty())
            .ok_or(ApplicationError::Unauthenticated)?;
        let tenant_id = self
            .tenant_id
            .clone()
            .filter(|id| !id.0.trim().is_empty())
            .ok_or(ApplicationError::Unauthenticated)?;
        Ok(AuthenticatedSession { user_id, tenant_id })
    }
}

#[cfg(test)]
mod tests {
    use super::Session;
    use crate::errors::ApplicationError;

    #[test]
    fn require_rejects_missing_user_or_tenant() {
        assert_eq!(Session::anonymous().require(), Err(ApplicationError::Unauthenticated));

        let mut session = Session::new("user-1", "tenant-1");
        session.tenant_id = None;
        assert_eq!(session.require(), Err(ApplicationError::Unauthenticated));

        let blank = Session::new("  ", "tenant-1");
        assert_eq!(blank.require(), Err(ApplicationError::Unauthenticated));
    }

    #[test]
    fn require_returns_both_identities() {
        let session = Session::new("maker-7", "pc-42").require().expect("authenticated");
        assert_eq!(session.user_id.0, "maker-7");
        assert_eq!(session.tenant_id.0, "pc-42");
    }
}
