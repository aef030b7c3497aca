//! Request/response endpoint
//!
//! Half-duplex: one request is decoded, dispatched and answered before the
//! next one is read. Protocol errors tear the connection down.

use std::io::{Read, Write};

use lg_error::{LegionError, Result};
use lg_protocol::{frame, Message, Payload};
use tracing::{debug, error, info, warn};

use super::ClientSlot;
use crate::context::Context;

pub struct ProtocolProcessor<S> {
    slot: ClientSlot<S>,
}

impl<S> Default for ProtocolProcessor<S> {
    fn default() -> Self {
        Self { slot: ClientSlot::new() }
    }
}

impl<S: Read + Write> ProtocolProcessor<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client; an occupied processor hands the stream back
    pub fn bind(&mut self, stream: S) -> std::result::Result<(), S> {
        self.slot.bind(stream)?;
        debug!("Request client bound");
        Ok(())
    }

    pub fn unbind(&mut self) -> Option<S> {
        self.slot.release()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.is_bound()
    }

    pub fn client(&self) -> Option<&S> {
        self.slot.get()
    }

    /// Answer every request that is currently readable
    ///
    /// Returns the number of requests served. A fatal error unbinds the
    /// client before it is returned.
    pub fn serve_pending(&mut self, ctx: &mut Context) -> Result<usize> {
        let mut served = 0;
        loop {
            let Some(stream) = self.slot.get_mut() else {
                return Ok(served);
            };

            let step = frame::try_read_message(stream).and_then(|request| match request {
                None => Ok(None),
                Some(request) => {
                    let response = handle_request(ctx, request)?;
                    frame::write_message(stream, &response).map(Some)
                }
            });

            match step {
                Ok(Some(())) => served += 1,
                Ok(None) => return Ok(served),
                Err(e) => {
                    match &e {
                        LegionError::ConnectionClosed => info!("Request client disconnected"),
                        e if e.is_fatal_to_connection() => error!("Dropping request client: {}", e),
                        e => warn!("Dropping request client: {}", e),
                    }
                    self.slot.release();
                    return Err(e);
                }
            }
        }
    }
}

/// Dispatch one decoded request
pub fn handle_request(ctx: &mut Context, request: Message) -> Result<Message> {
    match request {
        Message::RequestGet(data_type) => {
            let payload = ctx.get(data_type).unwrap_or_else(|e| {
                warn!("Get {}: {}", data_type, e);
                Payload::unavailable(data_type)
            });
            Ok(Message::ResponseGet(payload))
        }
        Message::RequestSet(payload) => {
            let status = ctx.set(&payload);
            debug!("Set {} -> {:?}", payload.data_type(), status);
            Ok(Message::ResponseSet(payload.data_type(), status))
        }
        other => Err(LegionError::protocol(format!(
            "client sent {:?}, only requests are accepted",
            other.message_type()
        ))),
    }
}
