use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::{Caller, Role};

/// Shared-secret authentication. The startup `user` must be the caller's ULID.
#[derive(Debug)]
pub struct RentdAuthSource {
    password: String,
}

impl RentdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RentdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().map(|u| u.to_string());
        if parse_user(user.as_deref()).is_none() {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(unauthenticated(user.as_deref()));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

fn parse_user(user: Option<&str>) -> Option<Ulid> {
    user.and_then(|u| Ulid::from_string(u.trim()).ok())
}

fn unauthenticated(user: Option<&str>) -> PgWireError {
    let msg = match user {
        Some(u) => format!("user `{u}` is not a valid user id"),
        None => "no user given at startup".to_string(),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28000".into(),
        msg,
    )))
}

/// Resolves the startup user into a caller, with the admin role for
/// configured admins.
pub fn resolve_caller(user: Option<&str>, admins: &HashSet<Ulid>) -> Option<Caller> {
    let user_id = parse_user(user)?;
    let role = if admins.contains(&user_id) {
        Role::Admin
    } else {
        Role::Member
    };
    Some(Caller { user_id, role })
}
