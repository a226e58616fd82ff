use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use uniprov_common::{ImageStatus, InstanceStatus, ProviderError, Result};

/// One entry of a record's state history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Image states only move forward; delete is allowed from any non-terminal
/// state and a build failure is terminal.
pub fn image_transition_allowed(from: ImageStatus, to: ImageStatus) -> bool {
    use ImageStatus::*;
    match (from, to) {
        (None, Building) | (Building, Built) | (Built, Staged) | (Staged, Published) => true,
        (Building, Failed) => true,
        (from, Deleted) => !from.is_terminal(),
        _ => false,
    }
}

pub fn instance_transition_allowed(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::*;
    match (from, to) {
        (None, Created) => true,
        (Created, Running) | (Stopped, Running) | (Running, Stopped) => true,
        (Created | Running | Stopped, Failed) => true,
        (from, Deleted) => from != Deleted,
        _ => false,
    }
}

/// Apply `to` to `status`, appending the change to `history`.
fn transition<S>(
    kind: &str,
    name: &str,
    status: &mut S,
    history: &mut Vec<Transition<S>>,
    to: S,
    reason: &str,
    allowed: fn(S, S) -> bool,
) -> Result<()>
where
    S: Copy + Display,
{
    let from = *status;
    if !allowed(from, to) {
        tracing::warn!(
            "⚠️ [state_machine] {} {}: refused {} -> {}",
            kind,
            name,
            from,
            to
        );
        return Err(ProviderError::InvalidState(format!(
            "{} '{}' cannot go from {} to {}",
            kind, name, from, to
        )));
    }

    tracing::info!(
        "🔄 [state_machine] {} {}: {} -> {} ({})",
        kind,
        name,
        from,
        to,
        reason
    );
    *status = to;
    history.push(Transition {
        from,
        to,
        reason: reason.to_string(),
        at: Utc::now(),
    });
    Ok(())
}

pub fn advance_image(
    name: &str,
    status: &mut ImageStatus,
    history: &mut Vec<Transition<ImageStatus>>,
    to: ImageStatus,
    reason: &str,
) -> Result<()> {
    transition("image", name, status, history, to, reason, image_transition_allowed)
}

pub fn advance_instance(
    name: &str,
    status: &mut InstanceStatus,
    history: &mut Vec<Transition<InstanceStatus>>,
    to: InstanceStatus,
    reason: &str,
) -> Result<()> {
    transition("instance", name, status, history, to, reason, instance_transition_allowed)
}
