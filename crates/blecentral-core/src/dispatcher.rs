//! Throttled command queue.
//!
//! BLE stacks misbehave when control-plane calls arrive back to back, so
//! every command is issued at least one settle interval after the previous
//! one, in FIFO order.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use blecentral_types::{CharacteristicAddress, WriteType};

use crate::session::SessionId;

/// A control-plane operation waiting to be issued.
///
/// Handshake steps carry the session that scheduled them so they can be
/// discarded if that session is gone by the time they are issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a scan window.
    StartScan { duration: Duration },
    /// Close the scan window early.
    StopScan,
    /// Connect to, or re-activate the link for, `address`.
    Connect { address: String },
    /// Orderly disconnect of the active session.
    Disconnect,
    /// Release the active session outright.
    Close,
    /// Start service discovery.
    DiscoverServices { session: SessionId },
    /// Enable notifications on one characteristic.
    EnableNotifications {
        session: SessionId,
        target: CharacteristicAddress,
    },
    /// Request an MTU exchange.
    RequestMtu { session: SessionId, mtu: u16 },
    /// Read a characteristic.
    Read { target: CharacteristicAddress },
    /// Write a characteristic.
    Write {
        target: CharacteristicAddress,
        value: Vec<u8>,
        write_type: WriteType,
    },
}

impl Command {
    /// Short name of the command, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartScan { .. } => "start_scan",
            Self::StopScan => "stop_scan",
            Self::Connect { .. } => "connect",
            Self::Disconnect => "disconnect",
            Self::Close => "close",
            Self::DiscoverServices { .. } => "discover_services",
            Self::EnableNotifications { .. } => "enable_notifications",
            Self::RequestMtu { .. } => "request_mtu",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
        }
    }
}

/// FIFO of commands separated by a minimum settle interval.
#[derive(Debug)]
pub struct CommandQueue {
    settle: Duration,
    pending: VecDeque<Command>,
    last_issued: Option<Instant>,
}

impl CommandQueue {
    /// Create a queue. A zero interval disables throttling.
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            pending: VecDeque::new(),
            last_issued: None,
        }
    }

    /// Append a command.
    pub fn push(&mut self, command: Command) {
        self.pending.push_back(command);
    }

    /// Earliest instant at which the next command may be issued, or `None`
    /// when the queue is empty.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        Some(match self.last_issued {
            Some(last) => (last + self.settle).max(now),
            None => now,
        })
    }

    /// Pop the head command if its settle interval has elapsed at `now`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<Command> {
        if let Some(last) = self.last_issued
            && now < last + self.settle
        {
            return None;
        }
        let command = self.pending.pop_front()?;
        self.last_issued = Some(now);
        Some(command)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTLE: Duration = Duration::from_millis(10);

    #[test]
    fn test_empty_queue_has_no_deadline() {
        let queue = CommandQueue::new(SETTLE);
        assert!(queue.next_deadline(Instant::now()).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_first_command_is_ready_immediately() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(SETTLE);
        queue.push(Command::StopScan);

        assert_eq!(queue.next_deadline(now), Some(now));
        assert_eq!(queue.pop_ready(now), Some(Command::StopScan));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_commands_are_spaced_by_settle_interval() {
        let start = Instant::now();
        let mut queue = CommandQueue::new(SETTLE);
        queue.push(Command::Disconnect);
        queue.push(Command::Close);

        assert_eq!(queue.pop_ready(start), Some(Command::Disconnect));
        assert_eq!(queue.pop_ready(start + Duration::from_millis(5)), None);
        assert_eq!(
            queue.next_deadline(start + Duration::from_millis(5)),
            Some(start + SETTLE)
        );
        assert_eq!(queue.pop_ready(start + SETTLE), Some(Command::Close));
    }

    #[test]
    fn test_settle_counts_from_last_issue() {
        let start = Instant::now();
        let mut queue = CommandQueue::new(SETTLE);
        queue.push(Command::StopScan);
        queue.pop_ready(start);

        // Pushed long after the previous issue: ready at once.
        let later = start + Duration::from_secs(1);
        queue.push(Command::Close);
        assert_eq!(queue.next_deadline(later), Some(later));
        assert_eq!(queue.pop_ready(later), Some(Command::Close));
    }

    #[test]
    fn test_zero_interval_disables_throttling() {
        let now = Instant::now();
        let mut queue = CommandQueue::new(Duration::ZERO);
        queue.push(Command::StopScan);
        queue.push(Command::Close);
        queue.push(Command::Disconnect);

        let issued: Vec<_> = std::iter::from_fn(|| queue.pop_ready(now)).collect();
        assert_eq!(
            issued,
            vec![Command::StopScan, Command::Close, Command::Disconnect]
        );
    }

    #[test]
    fn test_command_names() {
        let queue = CommandQueue::new(SETTLE);
        assert_eq!(
            Command::RequestMtu {
                session: SessionId::default(),
                mtu: 512
            }
            .name(),
            "request_mtu"
        );
        assert_eq!(Command::StopScan.name(), "stop_scan");
        assert!(queue.is_empty());
    }
}
