//! The embedding host: the window (or process) the console runs in.
//!
//! A browser console can be opened as a popup by another console window, which
//! may hand it credentials. On an authentication failure such a popup closes
//! itself instead of logging the whole application out. This module models
//! those two host capabilities behind a trait so sessions can be built for a
//! browser shell, a CLI, or a test fake alike.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Username/password pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDetails {
    pub username: String,
    pub password: String,
}

impl UserDetails {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both halves present and non-empty.
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for UserDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDetails")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Capabilities of the window hosting the console.
pub trait HostEnvironment: Send + Sync {
    /// True when this console was opened as a popup by another window.
    fn is_popup(&self) -> bool;

    /// Close the hosting window. Only meaningful for popups.
    fn close_window(&self);

    /// Credentials handed over by the opener, read once per session build.
    fn injected_credentials(&self) -> Option<UserDetails>;

    /// Forget the opener-supplied credentials (after they were rejected).
    fn clear_injected_credentials(&self);
}

/// A host with no opener window: never a popup, optional pre-supplied credentials.
#[derive(Debug, Default)]
pub struct DetachedHost {
    injected: Mutex<Option<UserDetails>>,
}

impl DetachedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: UserDetails) -> Self {
        Self {
            injected: Mutex::new(Some(credentials)),
        }
    }

    /// Pick up `JOLOKIA_USER` / `JOLOKIA_PASSWORD` from the environment.
    pub fn from_env() -> Self {
        match (std::env::var("JOLOKIA_USER"), std::env::var("JOLOKIA_PASSWORD")) {
            (Ok(user), Ok(password)) if !user.is_empty() && !password.is_empty() => {
                Self::with_credentials(UserDetails::new(user, password))
            }
            _ => Self::new(),
        }
    }
}

impl HostEnvironment for DetachedHost {
    fn is_popup(&self) -> bool {
        false
    }

    fn close_window(&self) {
        info!("close requested on a detached host, ignoring");
    }

    fn injected_credentials(&self) -> Option<UserDetails> {
        self.injected.lock().ok().and_then(|c| c.clone())
    }

    fn clear_injected_credentials(&self) {
        if let Ok(mut c) = self.injected.lock() {
            *c = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_details_debug_redacts_password() {
        let details = UserDetails::new("admin", "s3cret");
        let dbg = format!("{details:?}");
        assert!(dbg.contains("admin"));
        assert!(!dbg.contains("s3cret"));
    }

    #[test]
    fn user_details_incomplete_when_password_empty() {
        assert!(!UserDetails::new("admin", "").is_complete());
        assert!(UserDetails::new("admin", "pw").is_complete());
    }

    #[test]
    fn detached_host_is_not_popup() {
        assert!(!DetachedHost::new().is_popup());
    }

    #[test]
    fn detached_host_clears_injected_credentials() {
        let host = DetachedHost::with_credentials(UserDetails::new("a", "b"));
        assert_eq!(host.injected_credentials(), Some(UserDetails::new("a", "b")));
        host.clear_injected_credentials();
        assert_eq!(host.injected_credentials(), None);
    }
}
