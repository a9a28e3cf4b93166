//! [`PendingCommands`] – outstanding commands awaiting telemetry.
//!
//! A dispatched command is answered by an unordered stream of `state`
//! messages rather than by a reply.  Each dispatch registers a
//! [`PendingCommand`] keyed by its correlation key (order id or synthesized
//! command id); [`PendingCommands::correlate`] matches every incoming state
//! against the device's entries and settles the ones whose verdict is
//! decided.
//!
//! Settlement removes the entry under the same lock that evaluated it, so a
//! command is settled at most once no matter how many state messages race
//! for it.  Whoever receives a [`Settlement`] owns finalising the record.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fleetlink_types::{ActionState, CommandResult, DeviceState, Verdict};
use tracing::debug;

use crate::evaluator::{evaluate_iter, failure_reason};

/// Pending commands older than this are swept as timed out.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub correlation_key: String,
    pub device_id: String,
    /// The operator's original command, kept for reporting.
    pub command_text: String,
    /// Action ids carried by the dispatched envelope.
    pub action_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    registered: Instant,
}

impl PendingCommand {
    pub fn new(
        correlation_key: impl Into<String>,
        device_id: impl Into<String>,
        command_text: impl Into<String>,
        action_ids: Vec<String>,
    ) -> Self {
        Self {
            correlation_key: correlation_key.into(),
            device_id: device_id.into(),
            command_text: command_text.into(),
            action_ids,
            created_at: Utc::now(),
            registered: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.registered.elapsed()
    }

    /// Report this command as settled with `verdict`.
    pub fn into_result(self, verdict: Verdict, message: Option<String>) -> CommandResult {
        CommandResult {
            correlation_key: self.correlation_key,
            device_id: self.device_id,
            command_text: self.command_text,
            verdict,
            message,
            finished_at: Utc::now(),
        }
    }

    fn tracks(&self, action_id: &str) -> bool {
        self.action_ids.iter().any(|id| id == action_id)
    }

    /// An action the robot has not reported yet has not finished.
    fn all_reported(&self, states: &[&ActionState]) -> bool {
        self.action_ids
            .iter()
            .all(|id| states.iter().any(|s| &s.action_id == id))
    }
}

/// A pending command removed by [`PendingCommands::correlate`] together with
/// its decided verdict.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub command: PendingCommand,
    pub verdict: Verdict,
    /// Failure reason reported by the robot, if any.
    pub message: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// PendingCommands
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PendingCommands {
    entries: Mutex<HashMap<String, PendingCommand>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `command`.  A previous entry with the same key is replaced
    /// and returned.
    pub fn insert(&self, command: PendingCommand) -> Option<PendingCommand> {
        debug!(
            correlation_key = %command.correlation_key,
            device_id = %command.device_id,
            actions = command.action_ids.len(),
            "pending command registered"
        );
        self.lock().insert(command.correlation_key.clone(), command)
    }

    pub fn find(&self, correlation_key: &str) -> Option<PendingCommand> {
        self.lock().get(correlation_key).cloned()
    }

    pub fn remove(&self, correlation_key: &str) -> Option<PendingCommand> {
        self.lock().remove(correlation_key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the device's outstanding commands, oldest first.
    pub fn for_device(&self, device_id: &str) -> Vec<PendingCommand> {
        let mut commands: Vec<_> = self
            .lock()
            .values()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.registered);
        commands
    }

    /// Remove and return every entry.
    pub fn drain_all(&self) -> Vec<PendingCommand> {
        let mut commands: Vec<_> = self.lock().drain().map(|(_, c)| c).collect();
        commands.sort_by_key(|c| c.registered);
        commands
    }

    /// Remove and return every entry of one device.
    pub fn drain_device(&self, device_id: &str) -> Vec<PendingCommand> {
        self.drain_where(|c| c.device_id == device_id)
    }

    /// Remove and return every entry older than `ttl`.
    pub fn take_expired(&self, ttl: Duration) -> Vec<PendingCommand> {
        self.drain_where(|c| c.age() > ttl)
    }

    /// Match a state message against the device's pending commands and
    /// settle those with a decided verdict.
    ///
    /// The entry whose key equals the state's `orderId` is judged on the
    /// action states it tracks, or on all action states when it tracks
    /// none.  Any other entry is judged only on the action states whose ids
    /// it tracks and is skipped when none are present.  A tracked action
    /// missing from the message keeps the command in progress unless another
    /// tracked action already failed.
    pub fn correlate(&self, state: &DeviceState) -> Vec<Settlement> {
        let mut entries = self.lock();
        let keys: Vec<String> = entries
            .values()
            .filter(|c| c.device_id == state.serial_number)
            .map(|c| c.correlation_key.clone())
            .collect();

        let mut settled = Vec::new();
        for key in keys {
            let Some(command) = entries.get(&key) else {
                continue;
            };
            let owns_order = state.active_order() == Some(command.correlation_key.as_str());
            let tracked: Vec<&ActionState> = if owns_order && command.action_ids.is_empty() {
                state.action_states.iter().collect()
            } else {
                state
                    .action_states
                    .iter()
                    .filter(|s| command.tracks(&s.action_id))
                    .collect()
            };
            if tracked.is_empty() && !owns_order {
                continue;
            }

            let mut verdict = evaluate_iter(tracked.iter().copied());
            if verdict == Verdict::Success && !command.all_reported(&tracked) {
                verdict = Verdict::InProgress;
            }
            if !verdict.is_decided() {
                continue;
            }
            let message = match verdict {
                Verdict::Failure => failure_reason(tracked.iter().copied()),
                _ => None,
            };
            if let Some(command) = entries.remove(&key) {
                debug!(
                    correlation_key = %key,
                    device_id = %command.device_id,
                    verdict = ?verdict,
                    "pending command settled"
                );
                settled.push(Settlement {
                    command,
                    verdict,
                    message,
                });
            }
        }
        settled
    }

    fn drain_where(&self, predicate: impl Fn(&PendingCommand) -> bool) -> Vec<PendingCommand> {
        let mut entries = self.lock();
        let keys: Vec<String> = entries
            .values()
            .filter(|c| predicate(c))
            .map(|c| c.correlation_key.clone())
            .collect();
        let mut removed: Vec<_> = keys.iter().filter_map(|k| entries.remove(k)).collect();
        removed.sort_by_key(|c| c.registered);
        removed
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCommand>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_types::ActionStatus;
    use std::sync::Arc;
    use std::thread;

    fn state(device: &str, order_id: &str, actions: &[(&str, ActionStatus)]) -> DeviceState {
        DeviceState {
            header_id: 1,
            timestamp: None,
            manufacturer: "acme".to_string(),
            serial_number: device.to_string(),
            order_id: order_id.to_string(),
            order_update_id: 0,
            last_node_id: String::new(),
            driving: false,
            paused: false,
            operating_mode: None,
            action_states: actions
                .iter()
                .map(|(id, status)| ActionState::new(*id, *status))
                .collect(),
            errors: Vec::new(),
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn insert_find_remove() {
        let pending = PendingCommands::new();
        assert!(pending.insert(PendingCommand::new("cmd-1", "agv-01", "lift", ids(&["a1"]))).is_none());
        assert_eq!(pending.find("cmd-1").unwrap().command_text, "lift");
        assert!(pending.find("cmd-2").is_none());
        assert!(pending.remove("cmd-1").is_some());
        assert!(pending.remove("cmd-1").is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn instant_action_settles_on_tracked_action_ids() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("cmd-1", "agv-01", "lift", ids(&["a1"])));

        let running = state("agv-01", "", &[("a1", ActionStatus::Running)]);
        assert!(pending.correlate(&running).is_empty());
        assert_eq!(pending.len(), 1);

        let done = state("agv-01", "", &[("a1", ActionStatus::Finished)]);
        let settled = pending.correlate(&done);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].verdict, Verdict::Success);
        assert!(pending.is_empty());
    }

    #[test]
    fn partially_reported_actions_stay_pending() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("cmd-1", "agv-01", "lift", ids(&["a1", "a2"])));

        let first_only = state("agv-01", "", &[("a1", ActionStatus::Finished)]);
        assert!(pending.correlate(&first_only).is_empty());
        assert_eq!(pending.len(), 1);

        let both = state(
            "agv-01",
            "",
            &[("a1", ActionStatus::Finished), ("a2", ActionStatus::Finished)],
        );
        let settled = pending.correlate(&both);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].verdict, Verdict::Success);
    }

    #[test]
    fn reported_failure_settles_before_every_action_reports() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("cmd-1", "agv-01", "lift", ids(&["a1", "a2"])));

        let failed = state("agv-01", "", &[("a1", ActionStatus::Failed)]);
        let settled = pending.correlate(&failed);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].verdict, Verdict::Failure);
    }

    #[test]
    fn unrelated_action_states_are_skipped() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("cmd-1", "agv-01", "lift", ids(&["a1"])));
        let other = state("agv-01", "", &[("zz", ActionStatus::Finished)]);
        assert!(pending.correlate(&other).is_empty());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn other_devices_are_ignored() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("cmd-1", "agv-01", "lift", ids(&["a1"])));
        let foreign = state("agv-02", "", &[("a1", ActionStatus::Finished)]);
        assert!(pending.correlate(&foreign).is_empty());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn order_without_tracked_actions_uses_all_states() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("order-9", "agv-01", "raw order", Vec::new()));

        let idle = state("agv-01", "order-9", &[]);
        assert!(pending.correlate(&idle).is_empty());

        let failed = state(
            "agv-01",
            "order-9",
            &[("x", ActionStatus::Finished), ("y", ActionStatus::Failed)],
        );
        let settled = pending.correlate(&failed);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].verdict, Verdict::Failure);
        assert_eq!(settled[0].message.as_deref(), Some("action y failed"));
    }

    #[test]
    fn order_entry_ignores_foreign_action_states() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("order-9", "agv-01", "raw order", ids(&["p1"])));
        let state = state(
            "agv-01",
            "order-9",
            &[("p1", ActionStatus::Finished), ("other", ActionStatus::Failed)],
        );
        let settled = pending.correlate(&state);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].verdict, Verdict::Success);
    }

    #[test]
    fn settled_command_is_never_settled_twice() {
        let pending = Arc::new(PendingCommands::new());
        pending.insert(PendingCommand::new("cmd-1", "agv-01", "lift", ids(&["a1"])));
        let done = Arc::new(state("agv-01", "", &[("a1", ActionStatus::Finished)]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pending = Arc::clone(&pending);
                let done = Arc::clone(&done);
                thread::spawn(move || pending.correlate(&done).len())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn drain_all_empties_the_set() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("a", "agv-01", "x", Vec::new()));
        pending.insert(PendingCommand::new("b", "agv-02", "y", Vec::new()));
        assert_eq!(pending.drain_all().len(), 2);
        assert!(pending.drain_all().is_empty());
    }

    #[test]
    fn drain_device_leaves_other_devices() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("a", "agv-01", "x", Vec::new()));
        pending.insert(PendingCommand::new("b", "agv-02", "y", Vec::new()));
        let drained = pending.drain_device("agv-01");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].correlation_key, "a");
        assert_eq!(pending.for_device("agv-02").len(), 1);
    }

    #[test]
    fn take_expired_only_removes_old_entries() {
        let pending = PendingCommands::new();
        pending.insert(PendingCommand::new("old", "agv-01", "x", Vec::new()));
        thread::sleep(Duration::from_millis(30));
        pending.insert(PendingCommand::new("new", "agv-01", "y", Vec::new()));

        let expired = pending.take_expired(Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_key, "old");
        assert!(pending.find("new").is_some());
    }

    #[test]
    fn into_result_carries_command_context() {
        let command = PendingCommand::new("cmd-1", "agv-01", "lift pallet", Vec::new());
        let result = command.into_result(Verdict::Failure, Some("robot offline".to_string()));
        assert_eq!(result.correlation_key, "cmd-1");
        assert_eq!(result.command_text, "lift pallet");
        assert_eq!(result.verdict, Verdict::Failure);
        assert_eq!(result.message.as_deref(), Some("robot offline"));
    }
}
