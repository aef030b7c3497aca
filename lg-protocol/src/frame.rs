//! Bounded-retry frame I/O over non-blocking streams
//!
//! A frame has no length prefix, so the reader first takes the two header
//! bytes and then exactly the body size the header implies. Every wait for
//! more bytes is a bounded poll: once the retry budget runs out the read fails
//! with [`LegionError::DataNotReady`] and the frame is discarded.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use lg_error::{LegionError, Result};
use tracing::trace;

use crate::message::{Message, HEADER_LEN};

/// Poll attempts before a partial frame is abandoned
pub const READ_RETRY_BUDGET: u32 = 100;

/// Delay between two polls of a stream
pub const READ_RETRY_INTERVAL: Duration = Duration::from_millis(10);

fn is_retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

/// Fill `buf` completely, polling with the fixed retry budget
pub fn read_exact_bounded<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    let mut attempt = 0u32;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(LegionError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(e) if is_retryable(e.kind()) => {
                attempt += 1;
                if attempt > READ_RETRY_BUDGET {
                    return Err(LegionError::DataNotReady { expected: buf.len(), received: filled });
                }
                thread::sleep(READ_RETRY_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn read_body<R: Read + ?Sized>(reader: &mut R, header: [u8; HEADER_LEN]) -> Result<Message> {
    let (message_type, data_type) = Message::parse_header(header)?;
    let mut body = vec![0u8; message_type.body_len(data_type)];
    read_exact_bounded(reader, &mut body)?;

    trace!("frame {:?}/{} ({} byte body)", message_type, data_type, body.len());
    Message::from_parts(message_type, data_type, &body)
}

/// Read one complete message, waiting at most the retry budget per stage
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_bounded(reader, &mut header)?;
    read_body(reader, header)
}

/// Read one message if a frame has started arriving, `None` if nothing is pending
///
/// Once the first byte is in, the rest of the frame is read with the usual
/// bounded retry.
pub fn try_read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Message>> {
    let mut first = [0u8; 1];
    loop {
        match reader.read(&mut first) {
            Ok(0) => return Err(LegionError::ConnectionClosed),
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_retryable(e.kind()) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }

    let mut second = [0u8; 1];
    read_exact_bounded(reader, &mut second)?;
    read_body(reader, [first[0], second[0]]).map(Some)
}

/// Write a complete frame, retrying short writes with the same budget as reads
pub fn write_message<W: Write + ?Sized>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = message.encode();
    let mut written = 0;
    let mut attempt = 0u32;

    while written < frame.len() {
        match writer.write(&frame[written..]) {
            Ok(0) => return Err(LegionError::ConnectionClosed),
            Ok(n) => written += n,
            Err(e) if is_retryable(e.kind()) => {
                attempt += 1;
                if attempt > READ_RETRY_BUDGET {
                    return Err(LegionError::DataNotReady { expected: frame.len(), received: written });
                }
                thread::sleep(READ_RETRY_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => return Err(LegionError::ConnectionClosed),
            Err(e) => return Err(e.into()),
        }
    }
    writer.flush()?;

    trace!("sent {:?}/{} ({} bytes)", message.message_type(), message.data_type(), frame.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::*;
    use std::collections::VecDeque;
    use std::io;

    /// Scripted reader: each step yields bytes or a WouldBlock
    struct Script {
        steps: VecDeque<Option<Vec<u8>>>,
        would_block_forever: bool,
        polls: u32,
    }

    impl Script {
        fn new(steps: Vec<Option<Vec<u8>>>) -> Self {
            Self { steps: steps.into(), would_block_forever: true, polls: 0 }
        }
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.polls += 1;
            match self.steps.pop_front() {
                Some(Some(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.steps.push_front(Some(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(None) => Err(io::ErrorKind::WouldBlock.into()),
                None if self.would_block_forever => Err(io::ErrorKind::WouldBlock.into()),
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_reads_frame_split_across_polls() {
        let frame = Message::RequestSet(Payload::FanCurve(FanCurveData {
            points: [10, 20, 30, 40, 50, 60, 70, 80, 90, 100],
            available: true,
        }))
        .encode();

        let mut script = Script::new(vec![
            Some(frame[..1].to_vec()),
            None,
            Some(frame[1..5].to_vec()),
            None,
            None,
            Some(frame[5..].to_vec()),
        ]);
        let msg = read_message(&mut script).unwrap();
        assert_eq!(msg.data_type(), DataType::FanCurve);
    }

    #[test]
    fn test_stalled_body_is_data_not_ready() {
        let mut script = Script::new(vec![Some(vec![2, DataType::FanCurve as u8, 1, 2, 3])]);
        let err = read_message(&mut script).unwrap_err();
        assert!(matches!(err, LegionError::DataNotReady { expected: 11, received: 3 }));
        // one successful header read, one partial body read, then the budget
        assert_eq!(script.polls, 2 + READ_RETRY_BUDGET + 1);
    }

    #[test]
    fn test_try_read_returns_none_when_idle() {
        let mut script = Script::new(vec![]);
        assert!(try_read_message(&mut script).unwrap().is_none());
        assert_eq!(script.polls, 1);
    }

    #[test]
    fn test_eof_is_connection_closed() {
        let mut script = Script::new(vec![]);
        script.would_block_forever = false;
        assert!(matches!(try_read_message(&mut script), Err(LegionError::ConnectionClosed)));

        let mut script = Script::new(vec![Some(vec![0])]);
        script.would_block_forever = false;
        assert!(matches!(read_message(&mut script), Err(LegionError::ConnectionClosed)));
    }

    #[test]
    fn test_unknown_data_type_fails_before_body() {
        let mut script = Script::new(vec![Some(vec![0, 99])]);
        assert!(matches!(read_message(&mut script), Err(LegionError::UnknownDataType(99))));
        assert_eq!(script.polls, 1);
    }

    #[test]
    fn test_write_message_into_buffer() {
        let mut out = Vec::new();
        write_message(&mut out, &Message::RequestGet(DataType::Sensors)).unwrap();
        assert_eq!(out, vec![0, 6]);
    }
}
