//! Event system for roadmap operations
//!
//! Broadcasts engine events to listeners. Collaborators use them for:
//! - Audit logging
//! - Invalidating rendered roadmaps they cache
//! - Push notifications about newly available steps

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Events emitted by the roadmap services
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    // Career events
    CareerCreated {
        id: String,
        title: String,
    },
    CareerArchived {
        id: String,
        by: String,
    },
    CareerRestored {
        id: String,
    },

    // Step events
    StepCreated {
        id: String,
        career_id: String,
        order: i32,
    },
    StepUpdated {
        id: String,
    },
    StepMoved {
        id: String,
        career_id: String,
        from: i32,
        to: i32,
    },
    StepRemoved {
        id: String,
        career_id: String,
        order: i32,
    },
    StepArchived {
        id: String,
        by: String,
    },
    StepRestored {
        id: String,
    },

    // Ordering
    OrderEpochBumped {
        career_id: String,
        epoch: i64,
    },

    // Progress events
    ProgressRefreshed {
        user_id: String,
        career_id: String,
        epoch: i64,
    },
    StepStarted {
        user_id: String,
        step_id: String,
    },
    StepCompleted {
        user_id: String,
        step_id: String,
        percentage: f64,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    /// Handle an event
    fn on_event(&self, event: &EngineEvent);
}

/// Event bus for broadcasting engine events
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = ?event, "Emitting engine event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::StepCreated { id, career_id, order } => {
                debug!(id = %id, career = %career_id, order, "Step created");
            }
            EngineEvent::StepMoved { id, career_id, from, to } => {
                debug!(id = %id, career = %career_id, from, to, "Step moved");
            }
            EngineEvent::StepRemoved { id, career_id, order } => {
                debug!(id = %id, career = %career_id, order, "Step removed");
            }
            EngineEvent::OrderEpochBumped { career_id, epoch } => {
                debug!(career = %career_id, epoch, "Order epoch bumped");
            }
            EngineEvent::CareerArchived { id, by } => {
                info!(id = %id, by = %by, "Career archived");
            }
            _ => {
                trace!(event = ?event, "Engine event");
            }
        }
    }
}

/// Spawn a background task feeding every event to `listener`
pub fn spawn_listener<L>(event_bus: Arc<EventBus>, listener: L) -> tokio::task::JoinHandle<()>
where
    L: EventListener + 'static,
{
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, LoggingEventListener)
}
