//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use switchyard_agent::Orchestrator;
use switchyard_core::config::Config;

use crate::error::ApiError;

/// A turn that is still running.
struct ActiveTurn {
    user_id: String,
    cancel: CancellationToken,
}

/// Shared gateway state accessible from all handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    turns: Mutex<HashMap<String, ActiveTurn>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config: orchestrator.config().clone(),
            orchestrator,
            turns: Mutex::new(HashMap::new()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Build the orchestrator from config and, when enabled, install the
    /// Prometheus recorder.
    pub async fn from_config(config: Arc<Config>) -> anyhow::Result<Self> {
        let orchestrator = Arc::new(Orchestrator::from_config(config.clone()).await?);
        #[allow(unused_mut)]
        let mut state = Self::new(orchestrator);

        #[cfg(feature = "metrics")]
        if config.metrics_enabled() {
            state.metrics = Some(crate::metrics::install_prometheus_recorder()?);
            info!("Prometheus metrics enabled at /metrics");
        }

        Ok(state)
    }

    /// Track a running turn so it can be aborted.
    pub async fn register_turn(
        &self,
        turn_id: &str,
        user_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), ApiError> {
        let mut turns = self.turns.lock().await;
        if turns.contains_key(turn_id) {
            return Err(ApiError::conflict(format!("Turn '{turn_id}' is already running")));
        }
        turns.insert(
            turn_id.to_string(),
            ActiveTurn {
                user_id: user_id.to_string(),
                cancel,
            },
        );
        Ok(())
    }

    pub async fn finish_turn(&self, turn_id: &str) {
        self.turns.lock().await.remove(turn_id);
    }

    /// Cancel a caller's running turn. Returns false if no such turn exists
    /// for this caller.
    pub async fn abort_turn(&self, turn_id: &str, user_id: &str) -> bool {
        let turns = self.turns.lock().await;
        match turns.get(turn_id) {
            Some(turn) if turn.user_id == user_id => {
                info!(turn = %turn_id, user = %user_id, "Aborting turn");
                turn.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn active_turns(&self) -> usize {
        self.turns.lock().await.len()
    }
}
