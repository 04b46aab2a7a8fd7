//! Command acknowledgement tracking
//!
//! Control commands are accepted asynchronously by the backend: the REST
//! call returns a command id immediately and the device applies the change
//! later. One shared poll loop batches status checks for every in-flight
//! command and resolves per-command completion handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error};

use crate::api::rac::{CommandRef, CommandState};
use crate::errors::{Error, Result};

/// Fetches the current state of a batch of commands.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, commands: &[CommandRef]) -> Result<HashMap<String, CommandState>>;
}

/// Acknowledgement progress as observed by a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// No poll has reported this command yet.
    Pending,

    /// Last state reported by the status endpoint.
    Reported(CommandState),

    /// The shared poll loop failed; this command will receive no further
    /// updates.
    PollFailed,
}

impl AckState {
    pub fn is_done(self) -> bool {
        matches!(self, AckState::Reported(CommandState::Done))
    }
}

/// Waitable handle for one tracked command.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    command: CommandRef,
    rx: watch::Receiver<AckState>,
}

impl CommandHandle {
    pub fn command(&self) -> &CommandRef {
        &self.command
    }

    /// Last known acknowledgement state.
    pub fn state(&self) -> AckState {
        *self.rx.borrow()
    }

    /// Wait until the command reaches DONE. Fails with `CommandFailed` if
    /// the poll loop dies before that happens.
    pub async fn wait_done(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        loop {
            match *rx.borrow_and_update() {
                AckState::Reported(CommandState::Done) => return Ok(()),
                AckState::PollFailed => {
                    return Err(Error::CommandFailed(format!(
                        "status poll failed for command {}",
                        self.command.command_id
                    )));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::CommandFailed(format!(
                    "tracker dropped while waiting for command {}",
                    self.command.command_id
                )));
            }
        }
    }
}

struct CommandWatch {
    command: CommandRef,
    tx: watch::Sender<AckState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollerState {
    Idle,
    Running,
}

struct TrackerInner {
    watches: HashMap<String, CommandWatch>,
    poller: PollerState,
}

struct TrackerShared {
    source: Arc<dyn StatusSource>,
    poll_interval: Duration,
    state: Mutex<TrackerInner>,
}

/// Tracks in-flight commands and runs the shared status poll loop.
#[derive(Clone)]
pub struct CommandTracker {
    shared: Arc<TrackerShared>,
}

impl CommandTracker {
    pub fn new(source: Arc<dyn StatusSource>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                source,
                poll_interval,
                state: Mutex::new(TrackerInner {
                    watches: HashMap::new(),
                    poller: PollerState::Idle,
                }),
            }),
        }
    }

    /// Register a command and return its completion handle. Starts the poll
    /// loop if it is not already running; the Idle/Running flag lives inside
    /// the same lock as the watch set, so two registrations can never spawn
    /// two loops.
    pub async fn watch_command(&self, command: CommandRef) -> CommandHandle {
        let (tx, rx) = watch::channel(AckState::Pending);
        let handle = CommandHandle {
            command: command.clone(),
            rx,
        };

        let mut inner = self.shared.state.lock().await;
        debug!("Watch command {}", command.command_id);
        inner.watches.insert(
            command.command_id.clone(),
            CommandWatch { command, tx },
        );
        if inner.poller == PollerState::Idle {
            inner.poller = PollerState::Running;
            let shared = self.shared.clone();
            tokio::spawn(poll_loop(shared));
        }

        handle
    }

    /// Register a command and wait up to `timeout` for DONE. A timeout is
    /// not an error: the last known state is returned and the command stays
    /// tracked, so it may still complete later with no observer.
    pub async fn wait_ack(&self, command: CommandRef, timeout: Duration) -> Result<AckState> {
        let handle = self.watch_command(command).await;
        match tokio::time::timeout(timeout, handle.wait_done()).await {
            Ok(Ok(())) => Ok(AckState::Reported(CommandState::Done)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(handle.state()),
        }
    }
}

async fn poll_loop(shared: Arc<TrackerShared>) {
    debug!("Start command status poll loop");
    loop {
        let batch: Vec<CommandRef> = {
            let mut inner = shared.state.lock().await;
            // terminal handles are dropped at the iteration boundary, not
            // immediately, to tolerate concurrent registrations
            inner
                .watches
                .retain(|_, w| !w.tx.borrow().is_done());
            if inner.watches.is_empty() {
                inner.poller = PollerState::Idle;
                break;
            }
            inner.watches.values().map(|w| w.command.clone()).collect()
        };

        match shared.source.fetch(&batch).await {
            Ok(states) => {
                let inner = shared.state.lock().await;
                for (command_id, state) in states {
                    if let Some(w) = inner.watches.get(&command_id) {
                        let _ = w.tx.send(AckState::Reported(state));
                    }
                }
            }
            Err(e) => {
                error!("Failed to fetch command status, failing {} waiters: {}", batch.len(), e);
                let mut inner = shared.state.lock().await;
                for w in inner.watches.values() {
                    let _ = w.tx.send(AckState::PollFailed);
                }
                inner.watches.clear();
                inner.poller = PollerState::Idle;
                break;
            }
        }

        tokio::time::sleep(shared.poll_interval).await;
    }
    debug!("Finish command status poll loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Status source replaying a scripted sequence of poll results.
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<HashMap<String, CommandState>>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<HashMap<String, CommandState>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch(&self, commands: &[CommandRef]) -> Result<HashMap<String, CommandState>> {
            let mut responses = self.responses.lock().await;
            responses.pop_front().unwrap_or_else(|| {
                // keep reporting SENDING once the script runs out
                Ok(commands
                    .iter()
                    .map(|c| (c.command_id.clone(), CommandState::Sending))
                    .collect())
            })
        }
    }

    fn cmd(id: &str) -> CommandRef {
        CommandRef {
            command_id: id.to_string(),
            thing_id: format!("thing-{}", id),
        }
    }

    fn states(pairs: &[(&str, CommandState)]) -> Result<HashMap<String, CommandState>> {
        Ok(pairs
            .iter()
            .map(|(id, s)| (id.to_string(), *s))
            .collect())
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_resolve_independently() {
        let source = ScriptedSource::new(vec![
            states(&[("a1", CommandState::Sending)]),
            states(&[("a1", CommandState::Sending), ("a2", CommandState::Sending)]),
            states(&[("a1", CommandState::Sending), ("a2", CommandState::Done)]),
            states(&[("a1", CommandState::Done)]),
        ]);
        let tracker = CommandTracker::new(source, Duration::from_secs(2));

        let a1 = tracker.watch_command(cmd("a1")).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let a2 = tracker.watch_command(cmd("a2")).await;

        a2.wait_done().await.unwrap();
        assert!(!a1.state().is_done());
        a1.wait_done().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_done_stays_pending_until_done_is_reported() {
        use tokio_test::{assert_pending, assert_ready_ok};

        let source = ScriptedSource::new(vec![
            states(&[("a1", CommandState::Incomplete)]),
            states(&[("a1", CommandState::Done)]),
        ]);
        let tracker = CommandTracker::new(source, Duration::from_secs(2));

        let handle = tracker.watch_command(cmd("a1")).await;
        let mut waiter = tokio_test::task::spawn(handle.wait_done());
        assert_pending!(waiter.poll());

        // first poll reports INCOMPLETE; the waiter keeps waiting
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            handle.state(),
            AckState::Reported(CommandState::Incomplete)
        );
        assert_pending!(waiter.poll());

        // the next poll interval reports DONE
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_ready_ok!(waiter.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ack_zero_timeout_returns_immediately() {
        let source = ScriptedSource::new(vec![]);
        let tracker = CommandTracker::new(source, Duration::from_secs(2));

        let state = tracker
            .wait_ack(cmd("a1"), Duration::ZERO)
            .await
            .unwrap();
        assert!(matches!(
            state,
            AckState::Pending | AckState::Reported(CommandState::Sending)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_fails_all_waiters() {
        let source = ScriptedSource::new(vec![Err(Error::ConnectionFailed(
            "stub outage".to_string(),
        ))]);
        let tracker = CommandTracker::new(source, Duration::from_secs(2));

        let handle = tracker.watch_command(cmd("a1")).await;
        let err = handle.wait_done().await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed(_)));

        // the loop restarts on the next registration
        let again = tracker
            .wait_ack(cmd("a2"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(again, AckState::Reported(CommandState::Sending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ack_timeout_returns_last_known_state() {
        let source = ScriptedSource::new(vec![]);
        let tracker = CommandTracker::new(source, Duration::from_secs(2));

        let state = tracker
            .wait_ack(cmd("a1"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(state, AckState::Reported(CommandState::Sending));
    }
}
