//! Notification endpoint
//!
//! Events are written to the bound client as `Notification` frames. While no
//! client is bound they are queued (bounded, oldest dropped first) and the
//! backlog is flushed on the next bind.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};

use lg_error::{LegionError, Result};
use lg_protocol::{frame, Message, Payload};
use tracing::{debug, info, warn};

use super::ClientSlot;
use crate::constants::ipc::NOTIFY_QUEUE_LEN;

pub struct ProtocolNotifier<S> {
    slot: ClientSlot<S>,
    queue: VecDeque<Payload>,
    capacity: usize,
}

impl<S> Default for ProtocolNotifier<S> {
    fn default() -> Self {
        Self::with_capacity(NOTIFY_QUEUE_LEN)
    }
}

impl<S> ProtocolNotifier<S> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slot: ClientSlot::new(),
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    pub fn client(&self) -> Option<&S> {
        self.slot.get()
    }

    pub fn unbind(&mut self) -> Option<S> {
        self.slot.release()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn enqueue(&mut self, payload: Payload) {
        if self.capacity == 0 {
            return;
        }
        if self.queue.len() == self.capacity {
            if let Some(dropped) = self.queue.pop_front() {
                debug!("Notification queue full, dropping {}", dropped.data_type());
            }
        }
        self.queue.push_back(payload);
    }
}

impl<S: Read + Write> ProtocolNotifier<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listener and flush the backlog to it
    pub fn bind(&mut self, stream: S) -> std::result::Result<(), S> {
        self.slot.bind(stream)?;
        debug!("Notification client bound, {} queued", self.queue.len());
        while let Some(payload) = self.queue.pop_front() {
            if !self.send(&payload) {
                break;
            }
        }
        Ok(())
    }

    /// Deliver an event now, or queue it when nobody is listening
    pub fn publish(&mut self, payload: Payload) {
        if self.slot.is_bound() {
            self.send(&payload);
        } else {
            self.enqueue(payload);
        }
    }

    /// Write one notification; a failed write unbinds the listener
    fn send(&mut self, payload: &Payload) -> bool {
        let Some(stream) = self.slot.get_mut() else {
            return false;
        };
        let message = Message::Notification(payload.clone());
        match frame::write_message(stream, &message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping notification client: {}", e);
                self.slot.release();
                false
            }
        }
    }

    /// Called when the listener's socket turns readable
    ///
    /// Listeners never send anything, so readable means either hang-up or a
    /// protocol violation; both unbind the client.
    pub fn check_incoming(&mut self) -> Result<()> {
        let Some(stream) = self.slot.get_mut() else {
            return Ok(());
        };
        let mut byte = [0u8; 1];
        let outcome = loop {
            match stream.read(&mut byte) {
                Ok(0) => break Err(LegionError::ConnectionClosed),
                Ok(_) => break Err(LegionError::protocol("notification client sent data")),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        if let Err(e) = &outcome {
            match e {
                LegionError::ConnectionClosed => info!("Notification client disconnected"),
                e => warn!("Dropping notification client: {}", e),
            }
            self.slot.release();
        }
        outcome
    }
}
