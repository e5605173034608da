//! Keyed pool of live sessions.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Request, Response, Uri};
use tokio::sync::{Mutex, RwLock};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::settings::Http2Settings;
use crate::transport::h2::{ErrorCode, RecvStream, Session};
use crate::transport::Transport;
use crate::upgrade;

/// Destination a pooled session serves.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SessionKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl SessionKey {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Key for an absolute URI; the port defaults from the scheme.
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::config(format!("URI {} has no scheme", uri)))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::config(format!("URI {} has no host", uri)))?;
        let port = match uri.port_u16() {
            Some(port) => port,
            None if scheme.eq_ignore_ascii_case("https") => 443,
            None if scheme.eq_ignore_ascii_case("http") => 80,
            None => return Err(Error::config(format!("no default port for {}", scheme))),
        };
        Ok(Self::new(scheme, host, port))
    }

    fn default_port(&self) -> u16 {
        if self.scheme == "https" {
            443
        } else {
            80
        }
    }

    /// `host[:port]`, omitting the scheme's default port.
    pub fn authority(&self) -> String {
        if self.port == self.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Policy applied to every session the manager creates.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub settings: Http2Settings,
    pub session: SessionConfig,
    /// Live sessions kept per destination.
    ///
    /// Default: 1
    pub max_sessions_per_key: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            settings: Http2Settings::client(),
            session: SessionConfig::default(),
            max_sessions_per_key: 1,
        }
    }
}

impl ManagerConfig {
    pub fn with_settings(mut self, settings: Http2Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_max_sessions_per_key(mut self, max: usize) -> Self {
        self.max_sessions_per_key = max.max(1);
        self
    }
}

/// Client-side pool of sessions keyed by (scheme, host, port).
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionKey, Vec<Session>>>,
    /// One connect or upgrade at a time per key.
    connecting: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
    config: ManagerConfig,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// A pooled session for `key` that can open another stream.
    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        let start = Instant::now();
        let sessions = self.sessions.read().await;
        let Some(entries) = sessions.get(key) else {
            tracing::debug!("Session Pool: No sessions for {}", key);
            return None;
        };
        let found = entries.iter().find(|s| s.is_available()).cloned();
        match &found {
            Some(session) => tracing::debug!(
                "Session Pool: Reusing session for {} ({} active streams, took {:?})",
                key,
                session.active_stream_count(),
                start.elapsed()
            ),
            None => tracing::debug!(
                "Session Pool: {} sessions for {} but none available",
                entries.len(),
                key
            ),
        }
        found
    }

    /// Reuse a pooled session or start a new one over the transport returned
    /// by `connect`.
    pub async fn get_or_connect<F, Fut, T>(&self, key: &SessionKey, connect: F) -> Result<Session>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Transport,
    {
        if let Some(session) = self.get(key).await {
            return Ok(session);
        }

        let gate = self.connect_gate(key).await;
        let _connecting = gate.lock().await;
        // Whoever held the gate may have pooled a usable session
        if let Some(session) = self.get(key).await {
            return Ok(session);
        }
        self.ensure_capacity(key).await?;

        let io = connect().await?;
        let session = Session::new(io, self.config.session.clone());
        session
            .begin_client_session(self.config.settings.clone(), &key.authority(), &key.scheme)
            .await?;
        self.pool(key, &session).await?;
        Ok(session)
    }

    /// Bootstrap a session through an HTTP/1.1 `Upgrade: h2c` request.
    ///
    /// `request` becomes stream 1; its response is returned with the session.
    pub async fn upgrade<T: Transport>(
        &self,
        key: &SessionKey,
        io: T,
        request: Request<()>,
    ) -> Result<(Session, Response<RecvStream>)> {
        let gate = self.connect_gate(key).await;
        let _connecting = gate.lock().await;
        self.ensure_capacity(key).await?;
        let settings = self.config.settings.clone();
        let (reply, upgraded) = upgrade::client_handshake(io, request, &settings).await?;
        if !upgrade::is_upgrade_accepted(&reply) {
            return Err(Error::http_protocol(format!(
                "server declined h2c upgrade with {}",
                reply.status()
            )));
        }

        let session = Session::new(upgraded, self.config.session.clone());
        let response = session
            .begin_upgraded_client_session(settings, &key.authority(), &key.scheme)
            .await?;
        self.pool(key, &session).await?;
        Ok((session, response))
    }

    async fn connect_gate(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        let mut connecting = self.connecting.lock().await;
        // Drop gates nobody is waiting on
        connecting.retain(|_, gate| Arc::strong_count(gate) > 1);
        Arc::clone(connecting.entry(key.clone()).or_default())
    }

    /// Pool a freshly started session, shutting it down if the key filled up
    /// in the meantime.
    async fn pool(&self, key: &SessionKey, session: &Session) -> Result<()> {
        if let Err(err) = self.insert(key.clone(), session.clone()).await {
            session.shutdown(ErrorCode::NoError, "").await;
            return Err(err);
        }
        Ok(())
    }

    async fn ensure_capacity(&self, key: &SessionKey) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let Some(entries) = sessions.get_mut(key) else {
            return Ok(());
        };
        entries.retain(|s| s.is_active());
        if entries.len() >= self.config.max_sessions_per_key {
            tracing::debug!(
                "Session Pool: {} is at its limit of {} sessions",
                key,
                self.config.max_sessions_per_key
            );
            return Err(Error::PoolExhausted(key.to_string()));
        }
        Ok(())
    }

    /// Add a session started elsewhere. Fails with `PoolExhausted` when `key`
    /// already holds its limit of active sessions.
    pub async fn insert(&self, key: SessionKey, session: Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entries = sessions.entry(key.clone()).or_default();
        entries.retain(|s| s.is_active());
        if entries.len() >= self.config.max_sessions_per_key {
            return Err(Error::PoolExhausted(key.to_string()));
        }
        entries.push(session);
        tracing::debug!("Session Pool: Added session for {} (now {})", key, entries.len());
        Ok(())
    }

    /// Take every session for `key` out of the pool without closing them.
    pub async fn remove(&self, key: &SessionKey) -> Vec<Session> {
        self.sessions.write().await.remove(key).unwrap_or_default()
    }

    /// Drop sessions that are no longer active. Returns how many were dropped.
    pub async fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before: usize = sessions.values().map(Vec::len).sum();
        for entries in sessions.values_mut() {
            entries.retain(|s| s.is_active());
        }
        sessions.retain(|_, entries| !entries.is_empty());
        let after: usize = sessions.values().map(Vec::len).sum();
        if before != after {
            tracing::debug!("Session Pool: Cleaned up {} sessions", before - after);
        }
        before - after
    }

    /// Spawn a background task running [`cleanup`](Self::cleanup) periodically.
    pub fn spawn_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            loop {
                interval_timer.tick().await;
                self.cleanup().await;
            }
        })
    }

    /// Gracefully shut down and forget every pooled session.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().flat_map(|(_, entries)| entries).collect()
        };
        tracing::debug!("Session Pool: Shutting down {} sessions", drained.len());
        for session in drained {
            session.shutdown(ErrorCode::NoError, "").await;
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let sessions = self.sessions.read().await;
        let map: &HashMap<SessionKey, Vec<Session>> = &sessions;
        let all = || map.values().flatten();
        ManagerStats {
            keys: map.len(),
            total_sessions: all().count(),
            available_sessions: all().filter(|s| s.is_available()).count(),
            active_streams: all().map(Session::active_stream_count).sum(),
        }
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub keys: usize,
    pub total_sessions: usize,
    pub available_sessions: usize,
    pub active_streams: usize,
}
