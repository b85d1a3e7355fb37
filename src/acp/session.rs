use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::SessionId;
use crate::agent::RunCommand;

/// Identifies one run registered with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTicket(u64);

/// Handles of the run currently executing in a session.
struct ActiveRun {
    ticket: RunTicket,
    commands: mpsc::Sender<RunCommand>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl ActiveRun {
    fn end(self) {
        self.done.cancel();
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct RunSlot {
    next: u64,
    active: Option<ActiveRun>,
}

/// Per-session state held by the dispatcher.
///
/// The active run's command sink, cancel token and done signal are only ever
/// touched under `run`'s lock, and the sink never leaves this type. Calls
/// that carry a [`RunTicket`] only act on the run that ticket was issued for.
pub struct SessionState {
    pub agent_name: String,
    pub session_id: SessionId,
    pub cwd: String,
    run: Mutex<RunSlot>,
}

impl SessionState {
    pub fn new(session_id: SessionId, agent_name: String, cwd: String) -> Self {
        Self {
            agent_name,
            session_id,
            cwd,
            run: Mutex::new(RunSlot::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunSlot> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new active run. A run still registered is sent a cancel
    /// and ended first.
    pub fn start_run(&self, commands: mpsc::Sender<RunCommand>, cancel: CancellationToken) -> RunTicket {
        let mut slot = self.lock();
        if let Some(previous) = slot.active.take() {
            let _ = previous.commands.try_send(RunCommand::Cancel);
            previous.end();
        }
        slot.next += 1;
        let ticket = RunTicket(slot.next);
        slot.active = Some(ActiveRun {
            ticket,
            commands,
            cancel,
            done: CancellationToken::new(),
        });
        ticket
    }

    /// Ends the run `ticket` was issued for: fires its done signal, cancels
    /// its context and drops the command sink. Does nothing once that run
    /// has ended or been replaced.
    pub fn end_run(&self, ticket: RunTicket) {
        let mut slot = self.lock();
        if slot.active.as_ref().is_some_and(|active| active.ticket == ticket) {
            if let Some(active) = slot.active.take() {
                active.end();
            }
        }
    }

    #[cfg(test)]
    pub fn has_active_run(&self) -> bool {
        self.lock().active.is_some()
    }

    fn sink(&self, ticket: Option<RunTicket>) -> Option<(mpsc::Sender<RunCommand>, CancellationToken)> {
        let slot = self.lock();
        let active = slot.active.as_ref()?;
        if ticket.is_some_and(|ticket| ticket != active.ticket) {
            return None;
        }
        Some((active.commands.clone(), active.done.clone()))
    }

    async fn deliver(&self, ticket: Option<RunTicket>, command: RunCommand) -> bool {
        let Some((commands, done)) = self.sink(ticket) else {
            return false;
        };

        tokio::select! {
            sent = commands.send(command) => sent.is_ok(),
            _ = done.cancelled() => false,
        }
    }

    /// Delivers a command to whichever run is active. Waits for queue space,
    /// but gives up as soon as the run ends. Returns whether it was queued.
    pub async fn send_command(&self, command: RunCommand) -> bool {
        self.deliver(None, command).await
    }

    /// Queues a command for the active run without waiting. A full queue
    /// hands the command back; `Ok(false)` means no run took it.
    pub fn try_send_command(&self, command: RunCommand) -> Result<bool, RunCommand> {
        let Some((commands, _)) = self.sink(None) else {
            return Ok(false);
        };
        match commands.try_send(command) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(command)) => Err(command),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(false),
        }
    }

    /// Like [`SessionState::send_command`], restricted to the run `ticket`
    /// was issued for.
    pub async fn send_run_command(&self, ticket: RunTicket, command: RunCommand) -> bool {
        self.deliver(Some(ticket), command).await
    }

    /// Delivers a cancel to the run `ticket` was issued for without waiting.
    /// Returns whether it was queued.
    pub fn try_cancel(&self, ticket: RunTicket) -> bool {
        match self.sink(Some(ticket)) {
            Some((commands, _)) => commands.try_send(RunCommand::Cancel).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn session() -> SessionState {
        SessionState::new("s1".to_string(), "default".to_string(), "/tmp".to_string())
    }

    #[tokio::test]
    async fn commands_without_a_run_are_dropped() {
        let session = session();
        assert!(!session.send_command(RunCommand::Cancel).await);

        let (tx, _rx) = mpsc::channel(4);
        let ticket = session.start_run(tx, CancellationToken::new());
        session.end_run(ticket);
        session.end_run(ticket);
        assert!(!session.try_cancel(ticket));
        assert!(!session.send_run_command(ticket, RunCommand::Cancel).await);
    }

    #[tokio::test]
    async fn commands_reach_the_active_run() {
        let session = session();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let ticket = session.start_run(tx, cancel.clone());

        assert!(session.send_command(RunCommand::Cancel).await);
        assert_eq!(rx.recv().await, Some(RunCommand::Cancel));

        session.end_run(ticket);
        assert!(cancel.is_cancelled());
        assert!(!session.has_active_run());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn blocked_send_is_released_when_the_run_ends() {
        let session = Arc::new(session());
        let (tx, _rx) = mpsc::channel(1);
        let ticket = session.start_run(tx, CancellationToken::new());
        assert!(session.try_cancel(ticket));
        assert!(!session.try_cancel(ticket));

        let blocked = {
            let session = session.clone();
            tokio::spawn(async move { session.send_command(RunCommand::Cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.end_run(ticket);

        let sent = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn try_send_hands_back_commands_when_the_queue_is_full() {
        let session = session();
        assert_eq!(session.try_send_command(RunCommand::Cancel), Ok(false));

        let (tx, mut rx) = mpsc::channel(1);
        let ticket = session.start_run(tx, CancellationToken::new());
        assert_eq!(session.try_send_command(RunCommand::Cancel), Ok(true));
        assert_eq!(session.try_send_command(RunCommand::Cancel), Err(RunCommand::Cancel));

        assert_eq!(rx.recv().await, Some(RunCommand::Cancel));
        session.end_run(ticket);
        assert_eq!(session.try_send_command(RunCommand::Cancel), Ok(false));
    }

    #[tokio::test]
    async fn replaced_run_cannot_end_or_reach_its_successor() {
        let session = session();
        let (first_tx, mut first_rx) = mpsc::channel(4);
        let first_cancel = CancellationToken::new();
        let first = session.start_run(first_tx, first_cancel.clone());

        let (second_tx, mut second_rx) = mpsc::channel(4);
        let second_cancel = CancellationToken::new();
        let second = session.start_run(second_tx, second_cancel.clone());
        assert_ne!(first, second);

        assert!(first_cancel.is_cancelled());
        assert_eq!(first_rx.recv().await, Some(RunCommand::Cancel));
        assert_eq!(first_rx.recv().await, None);

        assert!(!session.try_cancel(first));
        assert!(
            !session
                .send_run_command(first, RunCommand::ApproveTool { call_id: "c1".to_string() })
                .await
        );
        session.end_run(first);
        assert!(session.has_active_run());
        assert!(!second_cancel.is_cancelled());
        assert!(second_rx.try_recv().is_err());

        assert!(session.try_cancel(second));
        assert_eq!(second_rx.recv().await, Some(RunCommand::Cancel));
        session.end_run(second);
        assert!(second_cancel.is_cancelled());
    }
}
