// Tokio driver for a room session.
//
// Owns the session on a spawned task: local edits and awareness updates
// arrive over a command channel without blocking the caller, room events
// flow back over an event channel, and a tick interval drives `pump`.
// Only discovery and channel handshakes ever wait on the network; the
// edit path stays synchronous inside the task.

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use cowrite_common::types::CursorLocator;

use crate::engine::replica::EditEvent;
use crate::session::{PeerConnector, RoomEvent, RoomSession, Signaling};

const DEFAULT_TICK: Duration = Duration::from_millis(25);

/// Commands accepted by a running room task.
#[derive(Debug)]
pub enum RoomCommand {
    Edit { doc: String, edit: EditEvent },
    Seed { doc: String, text: String },
    Awareness { cursor: Option<CursorLocator> },
    Leave,
}

/// Handle to a spawned room task. Dropping the handle leaves the room.
pub struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
    events: mpsc::UnboundedReceiver<RoomEvent>,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl RoomHandle {
    /// Queue a local edit; returns immediately.
    pub fn edit(&self, doc: impl Into<String>, edit: EditEvent) {
        let _ = self.commands.send(RoomCommand::Edit { doc: doc.into(), edit });
    }

    /// Seed a locally created document with initial content.
    pub fn seed(&self, doc: impl Into<String>, text: impl Into<String>) {
        let _ = self.commands.send(RoomCommand::Seed { doc: doc.into(), text: text.into() });
    }

    /// Broadcast the local cursor; `None` publishes a cursorless state.
    pub fn publish_awareness(&self, cursor: Option<CursorLocator>) {
        let _ = self.commands.send(RoomCommand::Awareness { cursor });
    }

    /// Next room event; `None` once the task has stopped.
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    /// Leave the room and stop the task.
    pub fn leave(&self) {
        let _ = self.commands.send(RoomCommand::Leave);
    }

    /// Leave and wait for the task to finish its teardown.
    pub async fn wait(mut self) {
        self.leave();
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(RoomCommand::Leave);
        let _ = self.shutdown_tx.send(());
    }
}

/// Join the room and drive it on a background task.
pub fn spawn<S, C>(session: RoomSession<S, C>) -> Result<RoomHandle>
where
    S: Signaling + Send + 'static,
    C: PeerConnector + Send + 'static,
{
    spawn_with_tick(session, DEFAULT_TICK)
}

/// `spawn` with an explicit pump interval.
pub fn spawn_with_tick<S, C>(
    mut session: RoomSession<S, C>,
    tick: Duration,
) -> Result<RoomHandle>
where
    S: Signaling + Send + 'static,
    C: PeerConnector + Send + 'static,
{
    session.join(Instant::now())?;

    let (commands, mut command_rx) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(4);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    session.leave();
                    break;
                }
                command = command_rx.recv() => match command {
                    Some(RoomCommand::Edit { doc, edit }) => {
                        session.local_edit(&doc, &edit, Instant::now());
                    }
                    Some(RoomCommand::Seed { doc, text }) => {
                        session.seed_document(&doc, &text, Instant::now());
                    }
                    Some(RoomCommand::Awareness { cursor }) => {
                        session.publish_awareness(cursor, Instant::now());
                    }
                    Some(RoomCommand::Leave) | None => {
                        session.leave();
                        break;
                    }
                },
                _ = ticker.tick() => {
                    for event in session.pump(Instant::now()) {
                        if event_tx.send(event).is_err() {
                            debug!("room event receiver dropped");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(RoomHandle { commands, events, shutdown_tx, task: Some(task) })
}
