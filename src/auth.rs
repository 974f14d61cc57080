use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// The single staff login. pgwire compares the cleartext password it
/// receives against what `get_password` returns.
#[derive(Debug)]
pub struct StaffAuthSource {
    user: String,
    password: String,
}

impl StaffAuthSource {
    pub fn new(user: String, password: String) -> Self {
        Self { user, password }
    }
}

#[async_trait]
impl AuthSource for StaffAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if user != self.user {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("login attempt for unknown user {user:?}");
            return Err(PgWireError::InvalidPassword(user.to_string()));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
