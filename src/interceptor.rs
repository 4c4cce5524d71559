//! # Per-Session Interceptors
//!
//! ## Responsibility
//! The middleware a session wraps around every outbound call:
//! - [`CredentialInjector`] adds exactly one `Authorization` header before send
//! - [`AuthFailureInterceptor`] reacts to the first 401/403 reply by closing the
//!   popup window or running the application-wide [`LogoutHooks`]
//!
//! ## Guarantees
//! - One interceptor instance per session; nothing here is process-global
//! - The auth-failure reaction runs at most once per session, however many
//!   in-flight requests fail together
//! - Logout hooks run in registration order; a failing (or panicking) hook is
//!   logged and the remaining hooks still run. Panic isolation relies on the
//!   unwinding panic strategy, which every profile of this crate keeps
//!
//! ## NOT Responsible For
//! - Re-authenticating (a new session is built after the user logs in again)
//! - Recording non-auth errors (the session keeps `last_error_response`)

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::host::HostEnvironment;
use crate::transport::{HttpReply, HttpRequest};

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// The single credential a session authenticates with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Bearer(token) => format!("Bearer {token}"),
            Credentials::Basic { username, password } => {
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
            }
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Credentials::Bearer(_) => "bearer",
            Credentials::Basic { .. } => "basic",
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request interceptors
// ---------------------------------------------------------------------------

/// Runs on every outbound request before it reaches the transport.
pub trait RequestInterceptor: Send + Sync {
    fn before_send(&self, request: &mut HttpRequest);
}

/// Installs the session's `Authorization` header.
#[derive(Debug, Clone)]
pub struct CredentialInjector {
    credentials: Credentials,
}

impl CredentialInjector {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

impl RequestInterceptor for CredentialInjector {
    fn before_send(&self, request: &mut HttpRequest) {
        request.set_header("Authorization", self.credentials.header_value());
    }
}

// ---------------------------------------------------------------------------
// Logout hooks
// ---------------------------------------------------------------------------

type HookFn = dyn Fn() -> Result<(), String> + Send + Sync;

/// Outcome of one logout sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutReport {
    /// Names of hooks that completed, in execution order.
    pub completed: Vec<String>,
    /// Names of hooks that returned an error or panicked.
    pub failed: Vec<String>,
}

/// Ordered, named pre-logout and post-logout tasks.
#[derive(Default)]
pub struct LogoutHooks {
    pre: Mutex<Vec<(String, Arc<HookFn>)>>,
    post: Mutex<Vec<(String, Arc<HookFn>)>>,
}

impl std::fmt::Debug for LogoutHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogoutHooks")
            .field("pre", &names(&self.pre))
            .field("post", &names(&self.post))
            .finish()
    }
}

fn names(list: &Mutex<Vec<(String, Arc<HookFn>)>>) -> Vec<String> {
    list.lock()
        .map(|l| l.iter().map(|(n, _)| n.clone()).collect())
        .unwrap_or_default()
}

fn snapshot(list: &Mutex<Vec<(String, Arc<HookFn>)>>) -> Vec<(String, Arc<HookFn>)> {
    list.lock().map(|l| l.clone()).unwrap_or_default()
}

impl LogoutHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task to run before logout. A task with the same name is replaced.
    pub fn add_pre_logout<F>(&self, name: impl Into<String>, task: F)
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        add(&self.pre, name.into(), Arc::new(task));
    }

    /// Register a task to run after logout. A task with the same name is replaced.
    pub fn add_post_logout<F>(&self, name: impl Into<String>, task: F)
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        add(&self.post, name.into(), Arc::new(task));
    }

    /// Remove `name` from both lists. Returns `true` when anything was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut removed = false;
        for list in [&self.pre, &self.post] {
            if let Ok(mut l) = list.lock() {
                let before = l.len();
                l.retain(|(n, _)| n != name);
                removed |= l.len() != before;
            }
        }
        removed
    }

    /// Run every pre-logout task, then every post-logout task.
    pub fn run(&self) -> LogoutReport {
        let mut report = LogoutReport::default();
        // Lists are snapshotted so a task may (un)register hooks without deadlocking.
        for (name, task) in snapshot(&self.pre).into_iter().chain(snapshot(&self.post)) {
            match catch_unwind(AssertUnwindSafe(|| task())) {
                Ok(Ok(())) => {
                    debug!(hook = %name, "logout hook completed");
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    warn!(hook = %name, error = %e, "logout hook failed, continuing");
                    report.failed.push(name);
                }
                Err(_) => {
                    warn!(hook = %name, "logout hook panicked, continuing");
                    report.failed.push(name);
                }
            }
        }
        report
    }
}

fn add(list: &Mutex<Vec<(String, Arc<HookFn>)>>, name: String, task: Arc<HookFn>) {
    if let Ok(mut l) = list.lock() {
        match l.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = task,
            None => l.push((name, task)),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth-failure interceptor
// ---------------------------------------------------------------------------

/// What the interceptor did with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailureAction {
    /// The popup window was asked to close.
    ClosedWindow,
    /// The logout sequence ran.
    LoggedOut(LogoutReport),
    /// Another failing request already triggered the reaction.
    AlreadyHandled,
}

/// Reacts once per session to a 401/403 reply.
pub struct AuthFailureInterceptor {
    fired: AtomicBool,
    host: Arc<dyn HostEnvironment>,
    hooks: Arc<LogoutHooks>,
}

impl std::fmt::Debug for AuthFailureInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFailureInterceptor")
            .field("fired", &self.has_fired())
            .finish_non_exhaustive()
    }
}

impl AuthFailureInterceptor {
    pub fn new(host: Arc<dyn HostEnvironment>, hooks: Arc<LogoutHooks>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            host,
            hooks,
        }
    }

    /// True once a 401/403 has been handled on this session.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Inspect a reply. Returns `None` for anything that is not 401/403.
    pub fn on_reply(&self, url: &str, reply: &HttpReply) -> Option<AuthFailureAction> {
        if !reply.is_auth_failure() {
            return None;
        }
        if self.fired.swap(true, Ordering::AcqRel) {
            debug!(url, status = reply.status, "auth failure already handled for this session");
            return Some(AuthFailureAction::AlreadyHandled);
        }

        self.host.clear_injected_credentials();
        if self.host.is_popup() {
            info!(url, status = reply.status, "authentication rejected, closing popup window");
            self.host.close_window();
            Some(AuthFailureAction::ClosedWindow)
        } else {
            info!(url, status = reply.status, "authentication rejected, logging out");
            Some(AuthFailureAction::LoggedOut(self.hooks.run()))
        }
    }
}
