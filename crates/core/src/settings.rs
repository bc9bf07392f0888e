//! Process-wide settings.

use crate::worker::Credentials;
use serde::{Deserialize, Serialize};

/// Global key/value settings, read-through cached over persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub global_worker_auth: Option<Credentials>,
    pub admin_credential: Option<Credentials>,
}

/// Read-side view that never exposes a stored password, only a
/// `has_password` flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalWorkerAuthView {
    pub username: Option<String>,
    pub has_password: bool,
}

impl From<Option<&Credentials>> for GlobalWorkerAuthView {
    fn from(creds: Option<&Credentials>) -> Self {
        match creds {
            Some(c) => GlobalWorkerAuthView { username: Some(c.username.clone()), has_password: !c.password.is_empty() },
            None => GlobalWorkerAuthView { username: None, has_password: false },
        }
    }
}
