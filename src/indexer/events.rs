use super::{IndexBuilder, Inner};
use crate::mailbox::MailboxEvent;
use crate::types::{BuildPhase, BuildProgress, MessageUpdate};
use std::collections::VecDeque;
use std::sync::Weak;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

pub(super) enum QueueItem {
    Event(MailboxEvent),
    Flush(oneshot::Sender<()>),
}

/// Single consumer of the event channel. Events wait in arrival order while
/// a build is running and are applied as soon as it stops, whether it
/// completed, paused or was cancelled.
pub(super) async fn run_queue(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    mut phase: watch::Receiver<BuildProgress>,
) {
    let mut pending: VecDeque<MailboxEvent> = VecDeque::new();
    let mut flushes: Vec<oneshot::Sender<()>> = Vec::new();

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(QueueItem::Event(event)) => pending.push_back(event),
                Some(QueueItem::Flush(done)) => flushes.push(done),
                None => break,
            },
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let builder = IndexBuilder { inner };

        while !is_building(&phase) {
            let Some(event) = pending.pop_front() else {
                break;
            };
            builder.apply_event(event).await;
        }
        if pending.is_empty() {
            for done in flushes.drain(..) {
                let _ = done.send(());
            }
        } else {
            debug!(queued = pending.len(), "Deferring mailbox events until the build stops");
        }
    }
}

fn is_building(phase: &watch::Receiver<BuildProgress>) -> bool {
    matches!(
        phase.borrow().phase,
        BuildPhase::Building | BuildPhase::Completing
    )
}

impl IndexBuilder {
    pub(crate) async fn apply_event(&self, event: MailboxEvent) {
        let message_id = event.message_id().to_string();
        let store = &self.inner.store;

        let result = match event {
            MailboxEvent::Insert(message) => self.index_message(message).await,
            MailboxEvent::Update {
                message,
                body_changed: true,
            } => self.index_message(message).await,
            MailboxEvent::Update {
                message,
                body_changed: false,
            } => {
                let update = MessageUpdate {
                    timestamp: Some(message.timestamp),
                    order: Some(message.order),
                    label_ids: Some(message.label_ids.clone()),
                    location: Some(message.location),
                    content: None,
                };
                match store.update(&message.id, &update).await {
                    Ok(true) => Ok(()),
                    Ok(false) => self.index_message(message).await,
                    Err(e) => Err(e),
                }
            }
            MailboxEvent::Move {
                message_id,
                label_ids,
                location,
            } => {
                let update = MessageUpdate {
                    label_ids: Some(label_ids),
                    location: Some(location),
                    ..MessageUpdate::default()
                };
                store.update(&message_id, &update).await.map(|_| ())
            }
            MailboxEvent::Delete { message_id } => store.delete(&message_id).await.map(|_| ()),
        };

        match result {
            Ok(()) => debug!(message_id = %message_id, "Applied mailbox event"),
            Err(e) => warn!(message_id = %message_id, error = %e, "Applying mailbox event failed"),
        }
        self.inner.cache.invalidate();
    }
}
