use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use uniprov_common::Result;
use uuid::Uuid;

/// An orchestrated action: one start record, completed in place.
#[derive(Debug, Clone, Serialize)]
pub struct ActionEvent {
    pub id: Uuid,
    pub action_type: String,
    pub component: &'static str,
    pub status: String,
    /// Image or instance name the action targets.
    pub target: String,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// In-memory action log for orchestrator actions
#[derive(Debug, Default)]
pub struct ActionLog {
    events: Mutex<Vec<ActionEvent>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ActionEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log_event(
        &self,
        action_type: &str,
        status: &str,
        target: &str,
        error_message: Option<&str>,
    ) -> Uuid {
        self.log_event_with_metadata(action_type, status, target, error_message, None)
    }

    /// Log event with metadata (context info)
    pub fn log_event_with_metadata(
        &self,
        action_type: &str,
        status: &str,
        target: &str,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Uuid {
        let log_id = Uuid::new_v4();
        self.lock().push(ActionEvent {
            id: log_id,
            action_type: action_type.to_string(),
            component: "orchestrator",
            status: status.to_string(),
            target: target.to_string(),
            error_message: error_message.map(|s| s.to_string()),
            metadata,
            duration_ms: None,
            created_at: Utc::now(),
            completed_at: None,
        });

        tracing::info!("📝 [Orchestrator] Logged: {} - {} ({})", action_type, status, log_id);
        log_id
    }

    /// Log event completion with duration
    pub fn log_event_complete(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: u64,
        error_message: Option<&str>,
    ) {
        let mut events = self.lock();
        let Some(event) = events.iter_mut().find(|e| e.id == log_id) else {
            tracing::warn!("⚠️ [Orchestrator] completion for unknown action {}", log_id);
            return;
        };
        event.status = status.to_string();
        event.duration_ms = Some(duration_ms);
        event.error_message = error_message.map(|s| s.to_string());
        event.completed_at = Some(Utc::now());

        if status == "success" {
            tracing::info!(
                "✅ [Orchestrator] {} {} completed in {}ms",
                event.action_type,
                event.target,
                duration_ms
            );
        } else {
            tracing::error!(
                "❌ [Orchestrator] {} {} {} after {}ms: {}",
                event.action_type,
                event.target,
                status,
                duration_ms,
                error_message.unwrap_or("")
            );
        }
    }

    /// Complete `log_id` from the outcome of the action it tracks.
    pub fn finish<T>(&self, log_id: Uuid, started: Instant, result: &Result<T>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => self.log_event_complete(log_id, "success", duration_ms, None),
            Err(e) => {
                let message = e.to_string();
                self.log_event_complete(log_id, "failed", duration_ms, Some(&message))
            }
        }
    }

    /// Quick log for one-off events
    pub fn log_quick(&self, action_type: &str, target: &str, details: Option<&str>) {
        let log_id = self.log_event(action_type, "in_progress", target, details);
        self.log_event_complete(log_id, "success", 0, details);
    }

    pub fn events(&self) -> Vec<ActionEvent> {
        self.lock().clone()
    }
}
