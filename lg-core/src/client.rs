//! Client library for unprivileged consumers
//!
//! Both clients use non-blocking sockets and the same bounded-retry frame
//! reader as the daemon, so a stalled daemon can never hang a caller.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Instant;

use lg_error::{LegionError, Result};
use lg_protocol::message::HEADER_LEN;
use lg_protocol::{frame, DataType, Message, Payload, SetStatus};
use tracing::{debug, trace};

use crate::constants::timing::{CLIENT_TIMEOUT, WATCH_INTERVAL};

fn connect(path: &Path) -> Result<UnixStream> {
    let stream = UnixStream::connect(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
            LegionError::generic(format!("daemon not running ({}): {}", path.display(), e))
        }
        std::io::ErrorKind::PermissionDenied => {
            LegionError::PermissionDenied(format!("{}: {}", path.display(), e))
        }
        _ => e.into(),
    })?;
    stream.set_nonblocking(true)?;
    debug!("Connected to {}", path.display());
    Ok(stream)
}

/// Get/set client for the request socket
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    pub fn connect(path: &Path) -> Result<Self> {
        Ok(Self { stream: connect(path)? })
    }

    pub fn get(&mut self, data_type: DataType) -> Result<Payload> {
        if data_type.is_notification() {
            return Err(LegionError::invalid(format!("{} cannot be requested", data_type)));
        }
        match self.round_trip(&Message::RequestGet(data_type))? {
            Message::ResponseGet(payload) if payload.data_type() == data_type => Ok(payload),
            other => Err(unexpected(&other)),
        }
    }

    pub fn set(&mut self, payload: Payload) -> Result<SetStatus> {
        let data_type = payload.data_type();
        if data_type.is_notification() {
            return Err(LegionError::invalid(format!("{} cannot be set", data_type)));
        }
        match self.round_trip(&Message::RequestSet(payload))? {
            Message::ResponseSet(dt, status) if dt == data_type => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    fn round_trip(&mut self, request: &Message) -> Result<Message> {
        frame::write_message(&mut self.stream, request)?;
        trace!("Sent {:?} {}", request.message_type(), request.data_type());

        let deadline = Instant::now() + CLIENT_TIMEOUT;
        loop {
            if let Some(response) = frame::try_read_message(&mut self.stream)? {
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(LegionError::DataNotReady {
                    expected: HEADER_LEN,
                    received: 0,
                });
            }
            thread::sleep(WATCH_INTERVAL);
        }
    }
}

fn unexpected(message: &Message) -> LegionError {
    LegionError::protocol(format!(
        "unexpected {:?} for {}",
        message.message_type(),
        message.data_type()
    ))
}

/// Listener on the notification socket
pub struct NotificationClient {
    stream: UnixStream,
}

impl NotificationClient {
    pub fn connect(path: &Path) -> Result<Self> {
        Ok(Self { stream: connect(path)? })
    }

    /// Next queued event, if one is already readable
    pub fn next_event(&mut self) -> Result<Option<Payload>> {
        match frame::try_read_message(&mut self.stream)? {
            None => Ok(None),
            Some(Message::Notification(payload)) => Ok(Some(payload)),
            Some(other) => Err(unexpected(&other)),
        }
    }

    /// Block until an event arrives or the daemon hangs up
    pub fn wait_event(&mut self) -> Result<Payload> {
        loop {
            if let Some(payload) = self.next_event()? {
                return Ok(payload);
            }
            thread::sleep(WATCH_INTERVAL);
        }
    }
}
