use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{Caller, Role};
use crate::observability::AUTH_FAILURES_TOTAL;

/// Login name of the administrator that always exists.
pub const BOOTSTRAP_ADMIN: &str = "admin";

/// One entry of the accounts file (`ROOMD_ACCOUNTS`), a JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub login: String,
    pub name: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
    pub password: String,
}

fn default_role() -> Role {
    Role::User
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("cannot read accounts file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed accounts file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate account {0}")]
    Duplicate(String),
    #[error("account {0}: {1}")]
    Invalid(String, &'static str),
}

#[derive(Debug)]
struct Entry {
    caller: Caller,
    password: String,
}

/// Who may log in, and as whom. Identity and role come from here; the engine
/// only ever sees the resulting `Caller`.
#[derive(Debug)]
pub struct Directory {
    entries: HashMap<String, Entry>,
}

impl Directory {
    /// A directory holding only the bootstrap administrator.
    pub fn new(admin_password: &str) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            BOOTSTRAP_ADMIN.to_string(),
            Entry {
                caller: Caller {
                    id: bootstrap_admin_id(),
                    name: "Administrator".to_string(),
                    email: String::new(),
                    role: Role::Admin,
                },
                password: admin_password.to_string(),
            },
        );
        Self { entries }
    }

    pub fn from_accounts(
        accounts: Vec<Account>,
        admin_password: &str,
    ) -> Result<Self, DirectoryError> {
        let mut dir = Self::new(admin_password);
        for account in accounts {
            if account.login.trim().is_empty() {
                return Err(DirectoryError::Invalid(account.id.to_string(), "empty login"));
            }
            if account.password.is_empty() {
                return Err(DirectoryError::Invalid(account.login, "empty password"));
            }
            if dir.entries.contains_key(&account.login)
                || dir.entries.values().any(|e| e.caller.id == account.id)
            {
                return Err(DirectoryError::Duplicate(account.login));
            }
            dir.entries.insert(
                account.login,
                Entry {
                    caller: Caller {
                        id: account.id,
                        name: account.name,
                        email: account.email,
                        role: account.role,
                    },
                    password: account.password,
                },
            );
        }
        Ok(dir)
    }

    pub fn load(path: &Path, admin_password: &str) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)?;
        Self::from_accounts(accounts, admin_password)
    }

    pub fn caller(&self, login: &str) -> Option<Caller> {
        self.entries.get(login).map(|e| e.caller.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn password(&self, login: &str) -> Option<&str> {
        self.entries.get(login).map(|e| e.password.as_str())
    }
}

/// Stable across restarts so the bootstrap admin keeps ownership of its bookings.
pub fn bootstrap_admin_id() -> Ulid {
    Ulid::from_parts(0, 1)
}

/// Cleartext password lookup for pgwire's startup handler.
#[derive(Debug, Clone)]
pub struct DirectoryAuthSource {
    directory: Arc<Directory>,
}

impl DirectoryAuthSource {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl AuthSource for DirectoryAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        match self.directory.password(user) {
            Some(password) => Ok(Password::new(None, password.as_bytes().to_vec())),
            None => {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!(user, "login for unknown account");
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28000".into(),
                    format!("unknown account {user:?}"),
                ))))
            }
        }
    }
}
