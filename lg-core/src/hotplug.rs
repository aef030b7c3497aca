//! Kernel uevent monitor
//!
//! Listens on a `NETLINK_KOBJECT_UEVENT` socket (kernel multicast group 1).
//! The socket is non-blocking; the reactor waits for readability and then
//! drains every pending datagram in one batch.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use lg_error::Result;
use tracing::{debug, trace};

use crate::driver::KernelEvent;

/// Kernel uevent multicast group
const KERNEL_GROUP: u32 = 1;

/// Largest uevent datagram the kernel sends
const UEVENT_BUFFER_SIZE: usize = 8192;

pub struct UeventMonitor {
    fd: OwnedFd,
}

impl UeventMonitor {
    pub fn open() -> Result<Self> {
        // SAFETY: socket() has no memory-safety preconditions; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: raw is a freshly created, valid descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = KERNEL_GROUP;

        // SAFETY: addr is a fully initialized sockaddr_nl and the length matches its size.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }

        debug!("Listening for kernel uevents");
        Ok(Self { fd })
    }

    /// Drain every pending datagram
    pub fn recv_events(&self) -> Result<Vec<KernelEvent>> {
        let mut events = Vec::new();
        let mut buf = vec![0u8; UEVENT_BUFFER_SIZE];

        loop {
            // SAFETY: buf is a valid writable buffer of buf.len() bytes for the whole call.
            let n = unsafe {
                libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            // n >= 0 was checked above
            let len = n as usize;
            if let Some(event) = parse_uevent(&buf[..len]) {
                trace!("uevent {} {} ({})", event.action, event.devpath, event.subsystem);
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl AsRawFd for UeventMonitor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Parse a kernel uevent datagram: `action@devpath\0KEY=VALUE\0...`
///
/// Datagrams re-broadcast by udev (`libudev` magic) and incomplete events
/// are ignored.
pub fn parse_uevent(buf: &[u8]) -> Option<KernelEvent> {
    let mut fields = buf.split(|b| *b == 0).filter(|f| !f.is_empty());
    let header = std::str::from_utf8(fields.next()?).ok()?;
    if header.starts_with("libudev") || !header.contains('@') {
        return None;
    }

    let mut action = None;
    let mut devpath = None;
    let mut subsystem = None;
    let mut driver = None;
    for field in fields {
        let Ok(field) = std::str::from_utf8(field) else {
            continue;
        };
        match field.split_once('=') {
            Some(("ACTION", v)) => action = Some(v),
            Some(("DEVPATH", v)) => devpath = Some(v),
            Some(("SUBSYSTEM", v)) => subsystem = Some(v),
            Some(("DRIVER", v)) => driver = Some(v),
            _ => {}
        }
    }

    Some(KernelEvent::new(action?, devpath?, subsystem?, driver))
}
