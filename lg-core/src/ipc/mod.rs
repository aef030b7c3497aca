//! Socket endpoints
//!
//! Two single-client endpoints share the daemon's event loop:
//!
//! - [`ProtocolProcessor`] answers get/set requests on the request socket
//! - [`ProtocolNotifier`] pushes driver events to the notification socket
//!
//! Both are generic over the stream so tests can drive them with
//! `UnixStream::pair()`.

mod notifier;
mod processor;
mod slot;

use std::os::fd::AsRawFd;

pub use notifier::ProtocolNotifier;
pub use processor::{handle_request, ProtocolProcessor};
pub use slot::ClientSlot;

/// Client credentials from a Unix socket peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// Read SO_PEERCRED for audit logging
pub fn peer_credentials<S: AsRawFd>(stream: &S) -> Option<PeerCredentials> {
    let fd = stream.as_raw_fd();

    // SAFETY: ucred is a plain C struct with no pointers; all-zero is a valid value.
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: fd is a live socket borrowed from `stream`, cred is initialized
    // above and len matches its size.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    (result == 0).then_some(PeerCredentials {
        uid: cred.uid,
        gid: cred.gid,
        pid: cred.pid,
    })
}
