use std::collections::HashMap;

// tokio's Instant so paused-clock tests can age queued commands.
use tokio::time::Instant;

use fleetlink_protocol::types::CommandPriority;

/// An operator-issued instruction parked for one device.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub queue_id: String,
    pub device_id: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: CommandPriority,
    pub created_at: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
}

/// Per-device ordered command backlog.
///
/// Ordering within a priority band is insertion order; a command is
/// inserted before the first entry of a strictly lower band, so a burst
/// of high-priority commands issued after a normal one still jumps ahead
/// of it while bands stay FIFO internally.
#[derive(Debug, Default)]
pub struct CommandQueue {
    queues: HashMap<String, Vec<QueuedCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a command and returns its queue id.
    pub fn enqueue(
        &mut self,
        device_id: &str,
        name: &str,
        payload: serde_json::Value,
        priority: CommandPriority,
        max_attempts: u32,
    ) -> String {
        let queue_id = uuid::Uuid::new_v4().to_string();
        let command = QueuedCommand {
            queue_id: queue_id.clone(),
            device_id: device_id.to_owned(),
            name: name.to_owned(),
            payload,
            priority,
            created_at: Instant::now(),
            attempts: 0,
            max_attempts,
        };

        let queue = self.queues.entry(device_id.to_owned()).or_default();
        let at = queue
            .iter()
            .position(|existing| existing.priority < priority)
            .unwrap_or(queue.len());
        queue.insert(at, command);
        queue_id
    }

    /// The head command for a device, if any.
    pub fn head(&self, device_id: &str) -> Option<&QueuedCommand> {
        self.queues.get(device_id).and_then(|q| q.first())
    }

    /// Mutable head access for attempt bookkeeping.
    pub(crate) fn head_mut(&mut self, device_id: &str) -> Option<&mut QueuedCommand> {
        self.queues.get_mut(device_id).and_then(|q| q.first_mut())
    }

    /// Removes and returns the head command.
    pub fn pop(&mut self, device_id: &str) -> Option<QueuedCommand> {
        let queue = self.queues.get_mut(device_id)?;
        if queue.is_empty() {
            return None;
        }
        let command = queue.remove(0);
        if queue.is_empty() {
            self.queues.remove(device_id);
        }
        Some(command)
    }

    /// Number of commands parked for a device.
    pub fn len(&self, device_id: &str) -> usize {
        self.queues.get(device_id).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, device_id: &str) -> bool {
        self.len(device_id) == 0
    }

    /// Devices that currently have a backlog.
    pub fn backlogged_devices(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Drops the whole backlog for a device (administrative removal).
    pub fn clear(&mut self, device_id: &str) -> usize {
        self.queues.remove(device_id).map_or(0, |q| q.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandPriority::{High, Low, Normal};

    fn enqueue(queue: &mut CommandQueue, name: &str, priority: CommandPriority) -> String {
        queue.enqueue("d1", name, serde_json::Value::Null, priority, 3)
    }

    fn drain_names(queue: &mut CommandQueue) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(cmd) = queue.pop("d1") {
            out.push(cmd.name);
        }
        out
    }

    #[test]
    fn priority_bands_with_fifo_within_band() {
        let mut queue = CommandQueue::new();
        enqueue(&mut queue, "A", Normal);
        enqueue(&mut queue, "B", High);
        enqueue(&mut queue, "C", Low);
        enqueue(&mut queue, "D", Normal);

        assert_eq!(drain_names(&mut queue), vec!["B", "A", "D", "C"]);
    }

    #[test]
    fn high_burst_after_normal_jumps_ahead() {
        let mut queue = CommandQueue::new();
        enqueue(&mut queue, "n1", Normal);
        enqueue(&mut queue, "h1", High);
        enqueue(&mut queue, "h2", High);

        assert_eq!(drain_names(&mut queue), vec!["h1", "h2", "n1"]);
    }

    #[test]
    fn normal_inserted_after_leading_high_run() {
        let mut queue = CommandQueue::new();
        enqueue(&mut queue, "h1", High);
        enqueue(&mut queue, "l1", Low);
        enqueue(&mut queue, "n1", Normal);

        assert_eq!(drain_names(&mut queue), vec!["h1", "n1", "l1"]);
    }

    #[test]
    fn devices_have_independent_queues() {
        let mut queue = CommandQueue::new();
        queue.enqueue("d1", "a", serde_json::Value::Null, Normal, 3);
        queue.enqueue("d2", "b", serde_json::Value::Null, Normal, 3);

        assert_eq!(queue.len("d1"), 1);
        assert_eq!(queue.len("d2"), 1);
        queue.pop("d1");
        assert!(queue.is_empty("d1"));
        assert_eq!(queue.len("d2"), 1);
    }

    #[test]
    fn pop_drops_empty_device_bucket() {
        let mut queue = CommandQueue::new();
        queue.enqueue("d1", "a", serde_json::Value::Null, Normal, 3);
        queue.pop("d1");
        assert!(queue.backlogged_devices().is_empty());
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mut queue = CommandQueue::new();
        enqueue(&mut queue, "a", Normal);
        enqueue(&mut queue, "b", High);
        assert_eq!(queue.clear("d1"), 2);
        assert!(queue.is_empty("d1"));
    }
}
