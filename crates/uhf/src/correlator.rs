//! Command/response correlation.
//!
//! The radio gives no transaction ids, so at most one command is
//! outstanding at a time and responses are matched purely by opcode.
//! Issuing while a command is pending replaces it: the newer command
//! wins and the displaced one's eventual response classifies as
//! unsolicited. Timeouts are delivered by the controller's response
//! timer and carry the issue generation so a stale shot cannot touch
//! a newer command.

use log::{debug, warn};
use tokio::time::Instant;

use crate::command::{expected_responses, opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdStatus {
    Ok = 0,
    Rejected = 1,
    TimedOut = 2,
}

/// The one outstanding command.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub opcode: u8,
    /// Kept verbatim for resend on timeout.
    pub args: Vec<u8>,
    /// IPC message id of the requester, for response fan-out.
    pub msg_id: u16,
    pub generation: u32,
    pub issued_at: Instant,
    pub retries_left: u8,
}

/// What one inbound response frame amounts to.
#[derive(Debug)]
pub enum Disposition {
    /// The pending command completed; notify the requester.
    Completed {
        msg_id: u16,
        opcode: u8,
        status: CmdStatus,
        payload: Vec<u8>,
    },
    /// Background telemetry refresh; nothing was pending on it.
    TelemetryUpdate(Vec<u8>),
    /// Nothing pending matched.
    Unsolicited,
}

#[derive(Debug)]
pub enum TimeoutDisposition {
    /// Retry budget remains; send the same bytes again.
    Resend { opcode: u8, args: Vec<u8> },
    /// Budget exhausted; the slot is free and the requester is told.
    Expired { msg_id: u16, opcode: u8 },
    /// The shot belonged to an older command.
    Stale,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelatorStats {
    pub completed: u64,
    pub unsolicited: u64,
    pub overwritten: u64,
    pub timeouts: u64,
}

#[derive(Default)]
pub struct Correlator {
    pending: Option<PendingCommand>,
    stats: CorrelatorStats,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }

    /// Install a new pending command, returning any command it
    /// displaced.
    pub fn issue(&mut self, cmd: PendingCommand) -> Option<PendingCommand> {
        let displaced = self.pending.replace(cmd);
        if let Some(old) = &displaced {
            self.stats.overwritten += 1;
            warn!(
                "pending command {:#04x} displaced before its response arrived",
                old.opcode
            );
        }
        displaced
    }

    pub fn on_response(&mut self, response_op: u8, args: &[u8]) -> Disposition {
        let matches_pending = self
            .pending
            .as_ref()
            .map(|p| expected_responses(p.opcode).contains(&response_op))
            .unwrap_or(false);
        if matches_pending {
            if let Some(pending) = self.pending.take() {
                self.stats.completed += 1;
                let status = match response_op {
                    opcode::NACK | opcode::BOOT_NACK => CmdStatus::Rejected,
                    _ => CmdStatus::Ok,
                };
                debug!(
                    "command {:#04x} completed by {:#04x} after {:?}",
                    pending.opcode,
                    response_op,
                    pending.issued_at.elapsed()
                );
                return Disposition::Completed {
                    msg_id: pending.msg_id,
                    opcode: pending.opcode,
                    status,
                    payload: args.to_vec(),
                };
            }
        }
        // the radio pushes telemetry on its own schedule too
        if response_op == opcode::TELEMETRY {
            return Disposition::TelemetryUpdate(args.to_vec());
        }
        self.stats.unsolicited += 1;
        debug!("unsolicited response {response_op:#04x} dropped");
        Disposition::Unsolicited
    }

    pub fn on_timeout(&mut self, generation: u32) -> TimeoutDisposition {
        let current = self
            .pending
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false);
        if !current {
            return TimeoutDisposition::Stale;
        }
        self.stats.timeouts += 1;
        if let Some(pending) = self.pending.as_mut() {
            if pending.retries_left > 0 {
                pending.retries_left -= 1;
                debug!(
                    "command {:#04x} timed out, {} resends left",
                    pending.opcode, pending.retries_left
                );
                return TimeoutDisposition::Resend {
                    opcode: pending.opcode,
                    args: pending.args.clone(),
                };
            }
        }
        match self.pending.take() {
            Some(pending) => {
                warn!(
                    "command {:#04x} abandoned {:?} after issue",
                    pending.opcode,
                    pending.issued_at.elapsed()
                );
                TimeoutDisposition::Expired {
                    msg_id: pending.msg_id,
                    opcode: pending.opcode,
                }
            }
            None => TimeoutDisposition::Stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(op: u8, msg_id: u16, generation: u32, retries: u8) -> PendingCommand {
        PendingCommand {
            opcode: op,
            args: vec![0x00],
            msg_id,
            generation,
            issued_at: Instant::now(),
            retries_left: retries,
        }
    }

    #[tokio::test]
    async fn test_expected_response_completes() {
        let mut corr = Correlator::new();
        assert!(corr.issue(cmd(opcode::GET_TIME, 0x0106, 1, 0)).is_none());

        match corr.on_response(opcode::TIME, &[1, 2, 3, 4]) {
            Disposition::Completed {
                msg_id,
                opcode: op,
                status,
                payload,
            } => {
                assert_eq!(msg_id, 0x0106);
                assert_eq!(op, opcode::GET_TIME);
                assert_eq!(status, CmdStatus::Ok);
                assert_eq!(payload, vec![1, 2, 3, 4]);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(corr.pending().is_none());
    }

    #[tokio::test]
    async fn test_nack_marks_rejected() {
        let mut corr = Correlator::new();
        corr.issue(cmd(opcode::SET_TIME, 0x0105, 1, 0));
        match corr.on_response(opcode::NACK, &[]) {
            Disposition::Completed { status, .. } => assert_eq!(status, CmdStatus::Rejected),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_newer_command_wins_the_slot() {
        let mut corr = Correlator::new();
        corr.issue(cmd(opcode::SET_TIME, 0x0105, 1, 0));
        let displaced = corr.issue(cmd(opcode::GET_TIME, 0x0106, 2, 0));
        assert_eq!(displaced.unwrap().opcode, opcode::SET_TIME);
        assert_eq!(corr.stats().overwritten, 1);

        // the displaced command's ACK no longer matches anything
        assert!(matches!(
            corr.on_response(opcode::ACK, &[]),
            Disposition::Unsolicited
        ));
        // the winner still completes
        assert!(matches!(
            corr.on_response(opcode::TIME, &[0; 4]),
            Disposition::Completed { msg_id: 0x0106, .. }
        ));
    }

    #[tokio::test]
    async fn test_telemetry_without_pending_refreshes_cache() {
        let mut corr = Correlator::new();
        match corr.on_response(opcode::TELEMETRY, &[9, 9]) {
            Disposition::TelemetryUpdate(data) => assert_eq!(data, vec![9, 9]),
            other => panic!("expected telemetry update, got {other:?}"),
        }
        assert_eq!(corr.stats().unsolicited, 0);

        // but a pending poll claims the reply
        corr.issue(cmd(opcode::GET_TELEMETRY, 0x0109, 1, 0));
        assert!(matches!(
            corr.on_response(opcode::TELEMETRY, &[1]),
            Disposition::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_resends_then_expires() {
        let mut corr = Correlator::new();
        corr.issue(cmd(opcode::RANGING, 0x010A, 5, 1));

        match corr.on_timeout(5) {
            TimeoutDisposition::Resend { opcode: op, args } => {
                assert_eq!(op, opcode::RANGING);
                assert_eq!(args, vec![0x00]);
            }
            other => panic!("expected resend, got {other:?}"),
        }
        match corr.on_timeout(5) {
            TimeoutDisposition::Expired { msg_id, opcode: op } => {
                assert_eq!(msg_id, 0x010A);
                assert_eq!(op, opcode::RANGING);
            }
            other => panic!("expected expiry, got {other:?}"),
        }
        assert!(corr.pending().is_none());
        assert!(matches!(corr.on_timeout(5), TimeoutDisposition::Stale));
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_touch_newer_command() {
        let mut corr = Correlator::new();
        corr.issue(cmd(opcode::GET_TIME, 0x0106, 7, 2));
        assert!(matches!(corr.on_timeout(6), TimeoutDisposition::Stale));
        assert_eq!(corr.pending().unwrap().retries_left, 2);
    }
}
