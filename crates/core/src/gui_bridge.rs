use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

use crate::envelope::Status;
use crate::progress::ProgressLevel;
use crate::task_manager::TaskManager;

/// One-shot signal raised from the UI thread and awaited on the loop.
///
/// A signal raised before anyone waits is kept, so a later `wait` returns
/// immediately.
#[derive(Clone)]
pub struct SyncEvent {
    id: String,
    signal: watch::Sender<bool>,
}

impl fmt::Debug for SyncEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncEvent")
            .field("id", &self.id)
            .field("set", &self.is_set())
            .finish()
    }
}

impl SyncEvent {
    fn new(id: String, set: bool) -> Self {
        let (signal, _) = watch::channel(set);
        Self { id, signal }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_set(&self) -> bool {
        *self.signal.borrow()
    }

    pub fn set(&self) {
        self.signal.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut signal_rx = self.signal.subscribe();
        let _ = signal_rx.wait_for(|set| *set).await;
    }
}

pub struct GuiBridge {
    manager: Arc<TaskManager>,
    events: Mutex<HashMap<String, SyncEvent>>,
    next_event: AtomicU64,
}

impl GuiBridge {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self {
            manager,
            events: Mutex::new(HashMap::new()),
            next_event: AtomicU64::new(0),
        }
    }

    /// Registers a fresh event. Without a running loop the returned event is
    /// already set, so waiting on it never blocks.
    pub fn create_sync_event(&self) -> (String, SyncEvent) {
        let id = format!(
            "sync_event_{}",
            self.next_event.fetch_add(1, Ordering::Relaxed)
        );
        if self.manager.loop_handle().is_none() {
            tracing::warn!(event = %id, "no background loop; returning a pre-set sync event");
            return (id.clone(), SyncEvent::new(id, true));
        }

        let event = SyncEvent::new(id.clone(), false);
        self.events_lock().insert(id.clone(), event.clone());
        (id, event)
    }

    pub fn signal_from_gui(&self, event_id: &str) {
        let Some(event) = self.events_lock().get(event_id).cloned() else {
            tracing::debug!(event = event_id, "ignoring signal for unknown sync event");
            return;
        };
        let Some(handle) = self.manager.loop_handle() else {
            tracing::warn!(event = event_id, "background loop unavailable; dropping signal");
            return;
        };
        handle.spawn(async move { event.set() });
    }

    pub fn cleanup_event(&self, event_id: &str) {
        self.events_lock().remove(event_id);
    }

    pub fn registered_events(&self) -> usize {
        self.events_lock().len()
    }

    fn events_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SyncEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub enum GuiEvent {
    Progress {
        task: String,
        message: String,
        level: ProgressLevel,
    },
    Finished {
        task: String,
        status: Status,
        summary: String,
    },
    Invoke(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for GuiEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress {
                task,
                message,
                level,
            } => formatter
                .debug_struct("Progress")
                .field("task", task)
                .field("message", message)
                .field("level", level)
                .finish(),
            Self::Finished {
                task,
                status,
                summary,
            } => formatter
                .debug_struct("Finished")
                .field("task", task)
                .field("status", status)
                .field("summary", summary)
                .finish(),
            Self::Invoke(_) => formatter.write_str("Invoke(..)"),
        }
    }
}

pub fn gui_channel() -> (GuiSender, GuiReceiver) {
    let (event_tx, event_rx) = mpsc::channel();
    (
        GuiSender { event_tx },
        GuiReceiver {
            event_rx,
            disconnected: false,
        },
    )
}

/// Loop-side half of the UI message queue.
#[derive(Clone, Debug)]
pub struct GuiSender {
    event_tx: mpsc::Sender<GuiEvent>,
}

impl GuiSender {
    pub fn progress(&self, task: &str, message: &str, level: ProgressLevel) -> bool {
        self.send(GuiEvent::Progress {
            task: task.to_string(),
            message: message.to_string(),
            level,
        })
    }

    pub fn finished(&self, task: &str, status: Status, summary: String) -> bool {
        self.send(GuiEvent::Finished {
            task: task.to_string(),
            status,
            summary,
        })
    }

    pub fn invoke(&self, action: impl FnOnce() + Send + 'static) -> bool {
        self.send(GuiEvent::Invoke(Box::new(action)))
    }

    fn send(&self, event: GuiEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }
}

/// UI-side half of the message queue; drained without blocking.
#[derive(Debug)]
pub struct GuiReceiver {
    event_rx: mpsc::Receiver<GuiEvent>,
    disconnected: bool,
}

impl GuiReceiver {
    pub fn drain(&mut self) -> Vec<GuiEvent> {
        let mut events = Vec::new();
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.mark_disconnected();
                    break;
                }
            }
        }
        events
    }

    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<GuiEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.mark_disconnected();
                None
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn mark_disconnected(&mut self) {
        if !self.disconnected {
            tracing::warn!("UI event channel disconnected");
            self.disconnected = true;
        }
    }
}
