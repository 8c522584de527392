//! Log-on collaborator.
//!
//! Sites that hide content behind an account plug in an [`Authenticator`].
//! The orchestrator only talks to it through [`AuthGate`], which makes sure
//! concurrent resolutions trigger at most one log-on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Account credentials, supplied by the host application.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of a successful log-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= Utc::now())
    }
}

/// Site specific log-on flow.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticator name (e.g., "tv-account").
    fn name(&self) -> &'static str;

    async fn log_on(&self, credential: &Credential) -> anyhow::Result<Session>;

    async fn is_authenticated(&self) -> bool;
}

/// Serializes log-ons in front of an [`Authenticator`].
pub struct AuthGate {
    authenticator: Arc<dyn Authenticator>,
    credential: Option<Credential>,
    session: Mutex<Option<Session>>,
}

impl AuthGate {
    pub fn new(authenticator: Arc<dyn Authenticator>, credential: Option<Credential>) -> Self {
        Self {
            authenticator,
            credential,
            session: Mutex::new(None),
        }
    }

    /// Make sure the session is authenticated before fetching `url`.
    ///
    /// Waiters that queued behind an in-flight log-on re-check and return
    /// without logging on again.
    /// A session whose recorded expiry has passed counts as logged off even
    /// if the authenticator still reports success.
    pub async fn ensure_logged_on(&self, url: &str) -> Result<()> {
        let expired = self.session.lock().await.as_ref().is_some_and(Session::is_expired);
        if !expired && self.authenticator.is_authenticated().await {
            return Ok(());
        }

        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(Session::is_expired) {
            debug!(url, "session expired, logging on again");
        } else if self.authenticator.is_authenticated().await {
            debug!(url, "log-on finished while waiting");
            return Ok(());
        }

        let Some(credential) = self.credential.as_ref() else {
            return Err(Error::LogonRequired { url: url.to_string() });
        };

        info!(authenticator = self.authenticator.name(), user = %credential.username, "logging on");
        let fresh = self.authenticator.log_on(credential).await.map_err(Error::LogonFailed)?;
        *session = Some(fresh);
        Ok(())
    }

    /// The session from the last successful log-on through this gate.
    pub async fn session(&self) -> Option<Session> {
        self.session.lock().await.clone()
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("authenticator", &self.authenticator.name())
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}
