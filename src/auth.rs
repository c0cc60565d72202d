use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::UserId;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password login. The login name is the caller's numeric user id.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// Parse a login name as a user id.
pub fn parse_user_id(login: Option<&str>) -> PgWireResult<UserId> {
    login
        .and_then(|u| u.trim().parse().ok())
        .ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("login must be a numeric user id, got {:?}", login.unwrap_or("")),
            )))
        })
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(e) = parse_user_id(login.user()) {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(e);
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
