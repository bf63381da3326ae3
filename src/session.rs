use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use axum::http::{HeaderMap, header::COOKIE};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Credential, Viewer};

pub const SESSION_COOKIE: &str = "timeline_session";
const PENDING_LOGIN_TTL_MINUTES: i64 = 10;
/// Upper bound on outstanding OAuth attempts; the oldest is evicted past it.
const MAX_PENDING_LOGINS: usize = 1024;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub credential: Credential,
    pub viewer: Viewer,
}

/// Per-request view of the caller's session, handed explicitly to every
/// handler that needs the credential.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    session_id: Option<String>,
    record: Option<SessionRecord>,
}

impl SessionContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.bearer_token().is_some()
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.record
            .as_ref()
            .map(|record| record.credential.bearer_token.as_str())
            .filter(|token| !token.is_empty())
    }

    pub fn viewer(&self) -> Option<&Viewer> {
        self.record.as_ref().map(|record| &record.viewer)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<String, SessionRecord>,
    pending_logins: HashMap<String, PendingLogin>,
}

struct PendingLogin {
    callback_url: String,
    created_at: DateTime<Utc>,
}

/// In-memory credential store. Session ids travel to the browser only inside
/// an HMAC-signed cookie; tokens never leave the process.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<StoreInner>>,
    mac: HmacSha256,
    ttl: Duration,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SessionStore")
            .field("mac", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, SessionError> {
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| SessionError::InvalidSecret)?;
        Ok(Self {
            inner: Arc::default(),
            mac,
            ttl,
        })
    }

    /// Stores a new session and sweeps every session that has outlived the
    /// TTL as of `now`.
    pub fn create(&self, credential: Credential, viewer: Viewer, now: DateTime<Utc>) -> String {
        let session_id = Uuid::new_v4().simple().to_string();
        let ttl = self.ttl;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|_, record| now - record.credential.issued_at < ttl);
        let swept = before - inner.sessions.len();
        if swept > 0 {
            debug!(swept, "removed expired sessions");
        }
        inner
            .sessions
            .insert(session_id.clone(), SessionRecord { credential, viewer });
        session_id
    }

    /// Returns the live session for `session_id`, dropping it first if it
    /// has outlived the TTL.
    pub fn resolve(&self, session_id: &str, now: DateTime<Utc>) -> Option<SessionRecord> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let expired = match inner.sessions.get(session_id) {
            None => return None,
            Some(record) => now - record.credential.issued_at >= self.ttl,
        };
        if expired {
            debug!("session expired; removing credential");
            inner.sessions.remove(session_id);
            return None;
        }
        inner.sessions.get(session_id).cloned()
    }

    pub fn destroy(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.sessions.remove(session_id).is_some()
    }

    /// Remembers where to send the user after the provider redirects back and
    /// returns the opaque OAuth `state` that identifies this attempt.
    pub fn begin_login(&self, callback_url: String, now: DateTime<Utc>) -> String {
        let state = Uuid::new_v4().simple().to_string();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner
            .pending_logins
            .retain(|_, pending| !pending_login_expired(pending, now));
        while inner.pending_logins.len() >= MAX_PENDING_LOGINS {
            let oldest = inner
                .pending_logins
                .iter()
                .min_by_key(|(_, pending)| pending.created_at)
                .map(|(state, _)| state.clone());
            let Some(oldest) = oldest else { break };
            inner.pending_logins.remove(&oldest);
        }
        inner.pending_logins.insert(
            state.clone(),
            PendingLogin {
                callback_url,
                created_at: now,
            },
        );
        state
    }

    /// Consumes a login attempt. Unknown or stale states yield `None`.
    pub fn complete_login(&self, state: &str, now: DateTime<Utc>) -> Option<String> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let pending = inner.pending_logins.remove(state)?;
        if pending_login_expired(&pending, now) {
            return None;
        }
        Some(pending.callback_url)
    }

    pub fn context_from_headers(&self, headers: &HeaderMap, now: DateTime<Utc>) -> SessionContext {
        let Some(session_id) =
            read_cookie(headers, SESSION_COOKIE).and_then(|value| self.verify(&value))
        else {
            return SessionContext::anonymous();
        };
        match self.resolve(&session_id, now) {
            Some(record) => SessionContext {
                session_id: Some(session_id),
                record: Some(record),
            },
            None => SessionContext::anonymous(),
        }
    }

    pub fn sign(&self, value: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        let signature = mac.finalize().into_bytes();
        format!("{value}.{}", hex::encode(signature))
    }

    pub fn verify(&self, signed: &str) -> Option<String> {
        let (value, signature) = signed.rsplit_once('.')?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac.clone();
        mac.update(value.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(value.to_owned())
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).sessions.len()
    }

    #[cfg(test)]
    fn pending_login_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pending_logins
            .len()
    }

    pub fn session_cookie(&self, session_id: &str, secure: bool) -> String {
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.sign(session_id),
            self.ttl.num_seconds()
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

pub fn expired_session_cookie(secure: bool) -> String {
    let mut cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn pending_login_expired(pending: &PendingLogin, now: DateTime<Utc>) -> bool {
    now - pending.created_at >= Duration::minutes(PENDING_LOGIN_TTL_MINUTES)
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_owned())
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session secret cannot be used as an HMAC key")]
    InvalidSecret,
}
