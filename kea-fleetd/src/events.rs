use anyhow::Result;
use tokio_util::sync::CancellationToken;
use shared::types::{Event, EventLevel};

/// Receives events after the store committed them and hands them to the
/// log. Anything else interested in fleet changes subscribes here.
pub struct EventCenter {
    rx: flume::Receiver<Event>,
}

/// Sender side goes to the store thread.
pub fn channel() -> (flume::Sender<Event>, EventCenter) {
    let (tx, rx) = flume::unbounded();
    (tx, EventCenter { rx })
}

impl EventCenter {
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                event = self.rx.recv_async() => match event {
                    Ok(event) => log_event(&event),
                    Err(_) => break,
                },
                _ = cancel.cancelled() => {
                    // Flush what was already committed.
                    for event in self.rx.drain() {
                        log_event(&event);
                    }
                    tracing::info!("Event center shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn log_event(event: &Event) {
    let text = event.render();
    match event.level {
        EventLevel::Info => tracing::info!(app_id = event.app_id, daemon_id = event.daemon_id, "{}", text),
        EventLevel::Warning => tracing::warn!(app_id = event.app_id, daemon_id = event.daemon_id, "{}", text),
        EventLevel::Error => {
            tracing::error!(app_id = event.app_id, daemon_id = event.daemon_id, details = %event.details, "{}", text)
        }
    }
}
