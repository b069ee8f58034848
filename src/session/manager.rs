// SPDX-License-Identifier: Apache-2.0

//! Session Service
//!
//! Owns every live session. A session is created by `logon`, kept alive by
//! `ping`, and destroyed by `logoff`, expiry, or administrative termination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use tessera_core::session::SECRET_LEN;
use tessera_core::{
    EngineError, EngineResult, LogonFailureKind, LogonResult, SessionId, SessionSecret,
    SessionToken, VdbRef,
};

use crate::config::SessionConfig;
use crate::metrics;
use crate::session::auth::{Authenticator, Credentials};

const COMPONENT: &str = "session service";

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCloseReason {
    Logoff,
    Expired,
    Terminated,
}

/// Notified whenever a session is invalidated.
///
/// Called outside the session lock; implementations must not block.
pub trait SessionListener: Send + Sync {
    fn session_closed(&self, session: SessionId, reason: SessionCloseReason);
}

/// Administrative view of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub username: String,
    pub vdb: VdbRef,
    pub created_at: DateTime<Utc>,
    pub last_ping_at: DateTime<Utc>,
}

struct LiveSession {
    token: SessionToken,
    vdb: VdbRef,
    created_at: DateTime<Utc>,
    last_ping_at: DateTime<Utc>,
    last_ping: Instant,
}

impl LiveSession {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.token.session_id,
            username: self.token.username.clone(),
            vdb: self.vdb.clone(),
            created_at: self.created_at,
            last_ping_at: self.last_ping_at,
        }
    }
}

pub struct SessionService {
    authenticator: Arc<dyn Authenticator>,
    config: SessionConfig,
    cluster_name: String,
    product_name: String,
    node_id: u16,
    next_session: AtomicU64,
    sessions: RwLock<HashMap<SessionId, LiveSession>>,
    listeners: SyncRwLock<Vec<Arc<dyn SessionListener>>>,
    available: AtomicBool,
}

impl SessionService {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        config: SessionConfig,
        cluster_name: impl Into<String>,
        product_name: impl Into<String>,
        node_id: u16,
    ) -> Self {
        Self {
            authenticator,
            config,
            cluster_name: cluster_name.into(),
            product_name: product_name.into(),
            node_id,
            next_session: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
            listeners: SyncRwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    /// Authenticates and mints a new session.
    #[instrument(skip(self, credentials), fields(user = %credentials.username, vdb = %credentials.vdb_name))]
    pub async fn logon(&self, credentials: Credentials) -> EngineResult<LogonResult> {
        self.ensure_available()?;

        let result = self.create_session(&credentials).await;
        metrics::record_logon(result.is_ok());
        match &result {
            Ok(logon) => info!(session = %logon.session_id(), "Session created"),
            Err(e) => warn!(error = %e, "Logon rejected"),
        }
        result
    }

    async fn create_session(&self, credentials: &Credentials) -> EngineResult<LogonResult> {
        let user = self.authenticator.authenticate(credentials).await?;

        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        let token = SessionToken {
            session_id: self.mint_session_id(),
            username: user.username,
            secret: SessionSecret::from_bytes(secret),
        };

        let now = Utc::now();
        {
            // Count and insert under one write lock so concurrent logons
            // cannot overshoot the quota.
            let mut sessions = self.sessions.write().await;
            let quota = self.config.max_sessions_per_user;
            if quota > 0 {
                let live = sessions
                    .values()
                    .filter(|s| s.token.username == token.username)
                    .count();
                if live >= quota {
                    return Err(EngineError::logon_failure(
                        LogonFailureKind::QuotaExceeded,
                        format!(
                            "user {} already has the maximum of {} sessions",
                            token.username, quota
                        ),
                    ));
                }
            }
            sessions.insert(
                token.session_id,
                LiveSession {
                    token: token.clone(),
                    vdb: user.vdb.clone(),
                    created_at: now,
                    last_ping_at: now,
                    last_ping: Instant::now(),
                },
            );
        }

        Ok(LogonResult {
            token,
            vdb: user.vdb,
            time_zone: self.time_zone(),
            cluster_name: self.cluster_name.clone(),
            product_name: self.product_name.clone(),
            ping_interval_ms: self.config.ping_interval_ms,
        })
    }

    /// Node id in the high bits keeps ids unique across a cluster.
    fn mint_session_id(&self) -> SessionId {
        let local = self.next_session.fetch_add(1, Ordering::Relaxed) & 0x0000_FFFF_FFFF_FFFF;
        SessionId((u64::from(self.node_id) << 48) | local)
    }

    fn time_zone(&self) -> String {
        self.config
            .time_zone
            .clone()
            .unwrap_or_else(|| chrono::Local::now().offset().to_string())
    }

    /// Liveness probe; refreshes the expiry clock.
    #[instrument(skip(self, token), fields(session = %token.session_id))]
    pub async fn ping(&self, token: &SessionToken) -> EngineResult<()> {
        self.ensure_available()?;
        let mut sessions = self.sessions.write().await;
        let session = Self::lookup(&sessions, token)?;
        self.ensure_unexpired(session)?;
        let session_id = session.token.session_id;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.last_ping = Instant::now();
            session.last_ping_at = Utc::now();
        }
        debug!("Ping");
        Ok(())
    }

    /// Ends the session; the token is rejected from now on.
    #[instrument(skip(self, token), fields(session = %token.session_id))]
    pub async fn logoff(&self, token: &SessionToken) -> EngineResult<()> {
        self.ensure_available()?;
        {
            let mut sessions = self.sessions.write().await;
            Self::lookup(&sessions, token)?;
            sessions.remove(&token.session_id);
        }
        info!("Session logged off");
        self.notify(token.session_id, SessionCloseReason::Logoff);
        Ok(())
    }

    /// Verifies id, username and secret together.
    pub async fn assert_identity(&self, token: &SessionToken) -> EngineResult<()> {
        self.session_info(token).await.map(|_| ())
    }

    /// Validates the token and returns the session it names.
    pub async fn session_info(&self, token: &SessionToken) -> EngineResult<SessionInfo> {
        self.ensure_available()?;
        let sessions = self.sessions.read().await;
        let session = Self::lookup(&sessions, token)?;
        self.ensure_unexpired(session)?;
        Ok(session.info())
    }

    /// An expired session stays rejected until the reaper removes it.
    fn ensure_unexpired(&self, session: &LiveSession) -> EngineResult<()> {
        if session.last_ping.elapsed() > self.config.expiry_after() {
            return Err(EngineError::invalid_session(format!(
                "session {} has expired",
                session.token.session_id
            )));
        }
        Ok(())
    }

    fn lookup<'a>(
        sessions: &'a HashMap<SessionId, LiveSession>,
        token: &SessionToken,
    ) -> EngineResult<&'a LiveSession> {
        sessions
            .get(&token.session_id)
            .filter(|session| session.token.same_identity(token))
            .ok_or_else(|| {
                EngineError::invalid_session(format!(
                    "session {} is not valid",
                    token.session_id
                ))
            })
    }

    /// Forcibly invalidates a session. Returns whether it existed.
    #[instrument(skip(self))]
    pub async fn terminate_session(&self, session_id: SessionId) -> EngineResult<bool> {
        self.ensure_available()?;
        let removed = self.sessions.write().await.remove(&session_id).is_some();
        if removed {
            info!("Session terminated");
            self.notify(session_id, SessionCloseReason::Terminated);
        }
        Ok(removed)
    }

    pub async fn active_sessions(&self) -> EngineResult<Vec<SessionInfo>> {
        self.ensure_available()?;
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions.values().map(LiveSession::info).collect();
        infos.sort_by_key(|info| info.session_id);
        Ok(infos)
    }

    /// Drops sessions whose last ping is older than the expiry window as of
    /// `now`. Returns the expired ids.
    pub async fn expire_stale_sessions(&self, now: Instant) -> Vec<SessionId> {
        let expiry = self.config.expiry_after();
        let expired: Vec<SessionId> = {
            let mut sessions = self.sessions.write().await;
            let stale: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.last_ping) > expiry)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                sessions.remove(id);
            }
            stale
        };

        for id in &expired {
            warn!(session = %id, "Session expired after missed pings");
            metrics::record_session_expired();
            self.notify(*id, SessionCloseReason::Expired);
        }
        expired
    }

    /// Runs `expire_stale_sessions` once per ping interval until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = self.config.ping_interval().max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if !service.available.load(Ordering::Acquire) {
                    break;
                }
                service.expire_stale_sessions(Instant::now()).await;
            }
        })
    }

    /// Stops accepting calls and drops every session.
    pub async fn shutdown(&self) {
        self.available.store(false, Ordering::Release);
        let ids: Vec<SessionId> = self.sessions.write().await.drain().map(|(id, _)| id).collect();
        for id in ids {
            self.notify(id, SessionCloseReason::Terminated);
        }
        info!("Session service shut down");
    }

    fn ensure_available(&self) -> EngineResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(EngineError::unavailable(COMPONENT, "the session service is shut down"))
        }
    }

    fn notify(&self, session: SessionId, reason: SessionCloseReason) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.session_closed(session, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::auth::PasswordAuthenticator;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        closed: Mutex<Vec<(SessionId, SessionCloseReason)>>,
    }

    impl SessionListener for RecordingListener {
        fn session_closed(&self, session: SessionId, reason: SessionCloseReason) {
            self.closed.lock().push((session, reason));
        }
    }

    fn service(quota: usize) -> SessionService {
        service_with(SessionConfig {
            max_sessions_per_user: quota,
            ping_interval_ms: 1_000,
            expiry_multiplier: 2,
            time_zone: Some("UTC".to_string()),
        })
    }

    fn service_with(config: SessionConfig) -> SessionService {
        let auth = PasswordAuthenticator::new();
        auth.add_user("alice", "pw").unwrap();
        auth.deploy_vdb("sales", 1);
        SessionService::new(Arc::new(auth), config, "cluster-a", "Tessera", 3)
    }

    fn creds() -> Credentials {
        Credentials::new("alice", "pw", "sales")
    }

    #[tokio::test]
    async fn logon_returns_negotiated_metadata() {
        let service = service(0);
        let logon = service.logon(creds()).await.unwrap();
        assert_eq!(logon.vdb, VdbRef::new("sales", 1));
        assert_eq!(logon.time_zone, "UTC");
        assert_eq!(logon.cluster_name, "cluster-a");
        assert_eq!(logon.ping_interval_ms, 1_000);
        assert_eq!(logon.session_id().0 >> 48, 3);
        service.assert_identity(&logon.token).await.unwrap();
    }

    #[tokio::test]
    async fn forged_secret_is_rejected() {
        let service = service(0);
        let logon = service.logon(creds()).await.unwrap();
        let mut forged = logon.token.clone();
        forged.secret = SessionSecret::from_bytes([0u8; SECRET_LEN]);
        let err = service.assert_identity(&forged).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn quota_is_enforced_per_user() {
        let service = service(1);
        service.logon(creds()).await.unwrap();
        let err = service.logon(creds()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::LogonFailure {
                kind: LogonFailureKind::QuotaExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn logoff_notifies_listeners_and_invalidates() {
        let service = service(0);
        let listener = Arc::new(RecordingListener::default());
        service.add_listener(listener.clone());

        let logon = service.logon(creds()).await.unwrap();
        service.logoff(&logon.token).await.unwrap();

        assert!(matches!(
            service.ping(&logon.token).await,
            Err(EngineError::InvalidSession { .. })
        ));
        assert_eq!(
            listener.closed.lock().as_slice(),
            &[(logon.session_id(), SessionCloseReason::Logoff)]
        );
    }

    #[tokio::test]
    async fn stale_sessions_expire() {
        let service = service(0);
        let listener = Arc::new(RecordingListener::default());
        service.add_listener(listener.clone());
        let logon = service.logon(creds()).await.unwrap();

        assert!(service.expire_stale_sessions(Instant::now()).await.is_empty());
        let expired = service
            .expire_stale_sessions(Instant::now() + Duration::from_secs(5))
            .await;
        assert_eq!(expired, vec![logon.session_id()]);
        assert!(service.assert_identity(&logon.token).await.is_err());
        assert_eq!(listener.closed.lock()[0].1, SessionCloseReason::Expired);
    }

    #[tokio::test]
    async fn terminate_and_shutdown() {
        let service = service(0);
        let logon = service.logon(creds()).await.unwrap();
        assert_eq!(service.active_sessions().await.unwrap().len(), 1);
        assert!(service.terminate_session(logon.session_id()).await.unwrap());
        assert!(!service.terminate_session(logon.session_id()).await.unwrap());

        service.shutdown().await;
        let err = service.logon(creds()).await.unwrap_err();
        assert!(matches!(err, EngineError::ComponentUnavailable { .. }));
    }

    #[tokio::test]
    async fn ping_does_not_revive_an_expired_session() {
        let service = service_with(SessionConfig {
            max_sessions_per_user: 0,
            ping_interval_ms: 20,
            expiry_multiplier: 1,
            time_zone: Some("UTC".to_string()),
        });
        let logon = service.logon(creds()).await.unwrap();
        service.ping(&logon.token).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(service.assert_identity(&logon.token).await.is_err());
        let err = service.ping(&logon.token).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSession { .. }));
        assert!(service.assert_identity(&logon.token).await.is_err());
    }
}
