//! Call Manager (C7): the process-wide session registry plus the HTTP
//! listener that fronts both the carrier webhook and the media
//! WebSocket. Grounded on the teacher's `server/device.rs`
//! (`DeviceRegistry`'s `RwLock<HashMap<...>>` plus a secondary
//! `active_device` pointer) and `server/mod.rs` (`ServerState`, the
//! public/protected route split, HTTPS via `axum_server`).

pub mod http;
pub mod media_ws;

use crate::carrier::CarrierClient;
use crate::config::Config;
use crate::error::{BridgeError, SessionNotFound};
use crate::session::{CallId, CallSession};
use crate::tools::ToolConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::Instrument;

/// How often `initiate_call` polls the fresh session for the carrier
/// ref `place_outbound` assigned it, so the webhook-routing index can
/// be populated before the first webhook for this call arrives.
const CARRIER_REF_POLL_MS: u64 = 100;
const CARRIER_REF_POLL_ATTEMPTS: u64 = 150;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Registry {
    by_call_id: HashMap<CallId, Arc<CallSession>>,
    by_carrier_ref: HashMap<String, CallId>,
    by_ws_token: HashMap<String, CallId>,
    /// Fallback target for untokenized `/media-stream` upgrades under
    /// `trust_without_signature` (spec §4.7's tunneled-deployment
    /// compatibility path). Best-effort only, never a durable binding.
    most_recent: Option<CallId>,
}

/// Owns every live `CallSession`, indexed for O(1) lookup by call id,
/// carrier call ref (webhook routing), and WS token (media upgrade
/// routing). One lock, short critical sections; no network I/O ever
/// happens while it's held.
pub struct CallManager {
    config: Arc<Config>,
    carrier: Arc<dyn CarrierClient>,
    tools: Arc<ToolConfig>,
    registry: RwLock<Registry>,
    started_at: Instant,
}

impl CallManager {
    pub fn new(config: Arc<Config>, tools: Arc<ToolConfig>) -> Result<Arc<Self>, BridgeError> {
        let carrier = crate::carrier::build(&config)?;
        Ok(Arc::new(Self {
            config,
            carrier,
            tools,
            registry: RwLock::new(Registry {
                by_call_id: HashMap::new(),
                by_carrier_ref: HashMap::new(),
                by_ws_token: HashMap::new(),
                most_recent: None,
            }),
            started_at: Instant::now(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn carrier(&self) -> &Arc<dyn CarrierClient> {
        &self.carrier
    }

    pub async fn active_call_count(&self) -> usize {
        self.registry.read().await.by_call_id.len()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    async fn insert(&self, session: Arc<CallSession>) {
        let mut reg = self.registry.write().await;
        reg.by_ws_token.insert(session.ws_token.as_str().to_string(), session.call_id.clone());
        reg.most_recent = Some(session.call_id.clone());
        reg.by_call_id.insert(session.call_id.clone(), session);
    }

    async fn register_carrier_ref(&self, call_ref: String, call_id: CallId) {
        let mut reg = self.registry.write().await;
        reg.by_carrier_ref.insert(call_ref, call_id);
    }

    async fn remove(&self, call_id: &CallId) {
        let mut reg = self.registry.write().await;
        reg.by_call_id.remove(call_id);
        reg.by_ws_token.retain(|_, v| v != call_id);
        reg.by_carrier_ref.retain(|_, v| v != call_id);
    }

    pub async fn by_call_id(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.registry.read().await.by_call_id.get(call_id).cloned()
    }

    pub async fn by_carrier_ref(&self, call_ref: &str) -> Option<Arc<CallSession>> {
        let reg = self.registry.read().await;
        let call_id = reg.by_carrier_ref.get(call_ref)?;
        reg.by_call_id.get(call_id).cloned()
    }

    /// Resolve and consume a media-stream token (I5: at most one
    /// successful WS upgrade per token). Tokens are compared in
    /// constant time via `auth::verify_ws_token` rather than by raw
    /// hash-map equality.
    async fn take_by_ws_token(&self, token: &str) -> Option<Arc<CallSession>> {
        let mut reg = self.registry.write().await;
        let matched = reg
            .by_ws_token
            .keys()
            .find(|candidate| crate::auth::verify_ws_token(candidate, token))
            .cloned()?;
        let call_id = reg.by_ws_token.remove(&matched)?;
        reg.by_call_id.get(&call_id).cloned()
    }

    async fn most_recent_session(&self) -> Option<Arc<CallSession>> {
        let reg = self.registry.read().await;
        let call_id = reg.most_recent.clone()?;
        reg.by_call_id.get(&call_id).cloned()
    }

    /// Driver RPC: `initiate_call`. Creates and registers the session,
    /// then drives it through `start()`. A background task races
    /// `start()` to pick up the carrier call ref as soon as
    /// `place_outbound` assigns it, so a webhook that arrives before
    /// `start()` returns still has somewhere to route to.
    pub async fn initiate_call(self: &Arc<Self>, message: &str) -> Result<(CallId, String), BridgeError> {
        let session = CallSession::new(
            self.config.carrier.user_number.clone().unwrap_or_default(),
            self.config.carrier.from_number.clone().unwrap_or_default(),
            self.carrier.clone(),
            self.tools.clone(),
            self.config.clone(),
        );
        self.insert(session.clone()).await;
        let call_span = tracing::info_span!("call", call_id = %session.call_id.as_str());

        let manager = self.clone();
        let poll_session = session.clone();
        let poll_span = call_span.clone();
        let poll_handle = tokio::spawn(
            async move {
                for _ in 0..CARRIER_REF_POLL_ATTEMPTS {
                    if let Some(call_ref) = poll_session.carrier_call_ref().await {
                        manager
                            .register_carrier_ref(call_ref.as_str().to_string(), poll_session.call_id.clone())
                            .await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(CARRIER_REF_POLL_MS)).await;
                }
            }
            .instrument(poll_span),
        );

        let result = session.start(message).instrument(call_span).await;
        poll_handle.abort();

        match result {
            Ok(response) => Ok((session.call_id.clone(), response)),
            Err(e) => {
                self.remove(&session.call_id).await;
                Err(e)
            }
        }
    }

    pub async fn continue_call(&self, call_id: &str, message: &str) -> Result<String, BridgeError> {
        let session = self.require_session(call_id).await?;
        let span = tracing::info_span!("call", call_id);
        session.inject(message).instrument(span).await
    }

    pub async fn speak_to_user(&self, call_id: &str, message: &str) -> Result<(), BridgeError> {
        let session = self.require_session(call_id).await?;
        let span = tracing::info_span!("call", call_id);
        session.speak(message).instrument(span).await
    }

    pub async fn end_call(&self, call_id: &str, message: &str) -> Result<(), BridgeError> {
        let session = self.require_session(call_id).await?;
        let span = tracing::info_span!("call", call_id);
        let result = session.end(message).instrument(span).await;
        self.remove(&session.call_id).await;
        result
    }

    async fn require_session(&self, call_id: &str) -> Result<Arc<CallSession>, BridgeError> {
        self.by_call_id(&CallId(call_id.to_string()))
            .await
            .ok_or_else(|| SessionNotFound(call_id.to_string()).into())
    }

    /// Process-wide shutdown: attempt a graceful `end` on every active
    /// session, bounded to `SHUTDOWN_GRACE` each, run concurrently.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<CallSession>> = self.registry.read().await.by_call_id.values().cloned().collect();
        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            let span = tracing::info_span!("call", call_id = %session.call_id.as_str());
            handles.push(tokio::spawn(
                async move {
                    let _ = tokio::time::timeout(SHUTDOWN_GRACE, session.end("")).await;
                }
                .instrument(span),
            ));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}
