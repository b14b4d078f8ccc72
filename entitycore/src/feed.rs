//! Lossless committed-event feeds.
//!
//! A host's broadcast channel is bounded, so a slow subscriber can miss
//! events. [`EventFeed`] uses the broadcast only as a signal that something
//! was committed and reads the events themselves from the host's log, tracking
//! the last log position it returned. Falling behind the broadcast buffer only
//! costs a re-read.

use crate::errors::StoreError;
use crate::event::{CommittedEvent, DomainEvent};
use crate::store::EventLog;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Events committed through one host, in log order, read back from its log.
pub struct EventFeed<E: DomainEvent> {
    log: Arc<dyn EventLog<E>>,
    tag: &'static str,
    signal: broadcast::Receiver<CommittedEvent<E>>,
    offset: u64,
    pending: VecDeque<CommittedEvent<E>>,
}

impl<E: DomainEvent> EventFeed<E> {
    /// Reads events tagged `tag` from `log` after position `offset`, waking up
    /// whenever `signal` carries a commit.
    ///
    /// Subscribe `signal` before reading `offset` from the log, or commits in
    /// between are only seen with the next one.
    pub fn new(
        log: Arc<dyn EventLog<E>>,
        tag: &'static str,
        signal: broadcast::Receiver<CommittedEvent<E>>,
        offset: u64,
    ) -> Self {
        Self {
            log,
            tag,
            signal,
            offset,
            pending: VecDeque::new(),
        }
    }

    /// Log position of the newest event read so far.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// The next committed event.
    ///
    /// Returns `None` once the host is gone and the log holds nothing newer.
    /// After an error the same events are read again on the next call.
    pub async fn recv(&mut self) -> Option<Result<CommittedEvent<E>, StoreError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            match self.catch_up().await {
                Ok(0) => {}
                Ok(_) => continue,
                Err(error) => return Some(Err(error)),
            }
            match self.signal.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    debug!(tag = self.tag, missed, "feed lagged, catching up from the log");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    async fn catch_up(&mut self) -> Result<usize, StoreError> {
        let mut envelopes = self.log.events_by_tag(self.tag, self.offset);
        let mut read = 0;
        while let Some(envelope) = envelopes.next().await {
            let envelope = envelope?;
            self.offset = envelope.log_position;
            self.pending.push_back(envelope.event);
            read += 1;
        }
        Ok(read)
    }
}
