//! Embedded Controller access over the legacy ACPI EC ports
//!
//! The EC is driven through two I/O ports: a command/status port and a data
//! port. Every byte transfer is gated on a status bit:
//!
//! - **IBF** (input buffer full, bit 1) must be clear before the host writes
//! - **OBF** (output buffer full, bit 0) must be set before the host reads
//!
//! Each wait polls at most [`POLL_BUDGET`] times with [`POLL_INTERVAL`] between
//! polls, so a dead EC costs about 100 ms per wait and then fails with
//! [`LegionError::EcBusy`]. There is no retry above that budget.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use lg_error::{LegionError, Result};
use tracing::trace;

/// EC command/status port
pub const EC_COMMAND_PORT: u16 = 0x66;

/// EC data port
pub const EC_DATA_PORT: u16 = 0x62;

/// Read-EC command byte
pub const RD_EC: u8 = 0x80;

/// Write-EC command byte
pub const WR_EC: u8 = 0x81;

/// Status bit: output buffer full
pub const STATUS_OBF: u8 = 1 << 0;

/// Status bit: input buffer full
pub const STATUS_IBF: u8 = 1 << 1;

/// Maximum number of status polls per wait
pub const POLL_BUDGET: u32 = 100;

/// Delay between two status polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Byte-wide access to the I/O port space
#[cfg_attr(test, mockall::automock)]
pub trait PortIo {
    fn inb(&self, port: u16) -> std::io::Result<u8>;
    fn outb(&self, port: u16, value: u8) -> std::io::Result<()>;
}

/// Port access through `/dev/port`, where the file offset is the port number
pub struct DevPort {
    file: File,
}

impl DevPort {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LegionError::FileRead { path: path.to_path_buf(), source: e })?;
        Ok(Self { file })
    }
}

impl PortIo for DevPort {
    fn inb(&self, port: u16) -> std::io::Result<u8> {
        let mut buf = [0u8; 1];
        self.file.read_exact_at(&mut buf, u64::from(port))?;
        Ok(buf[0])
    }

    fn outb(&self, port: u16, value: u8) -> std::io::Result<()> {
        self.file.write_all_at(&[value], u64::from(port))
    }
}

impl<P: PortIo + ?Sized> PortIo for Box<P> {
    fn inb(&self, port: u16) -> std::io::Result<u8> {
        (**self).inb(port)
    }

    fn outb(&self, port: u16, value: u8) -> std::io::Result<()> {
        (**self).outb(port, value)
    }
}

/// Embedded controller bound to a port backend
pub struct EmbeddedController<P: PortIo> {
    io: P,
}

impl<P: PortIo> EmbeddedController<P> {
    pub fn new(io: P) -> Self {
        Self { io }
    }

    /// Read one EC register
    pub fn ec_read(&self, register: u16) -> Result<u8> {
        let address = register_address(register)?;

        self.wait_input_empty()?;
        self.io.outb(EC_COMMAND_PORT, RD_EC)?;
        self.wait_input_empty()?;
        self.io.outb(EC_DATA_PORT, address)?;
        self.wait_output_full()?;
        let value = self.io.inb(EC_DATA_PORT)?;

        trace!("EC read 0x{:02X} -> 0x{:02X}", address, value);
        Ok(value)
    }

    /// Write one EC register
    pub fn ec_write(&self, register: u16, value: u8) -> Result<()> {
        let address = register_address(register)?;

        self.wait_input_empty()?;
        self.io.outb(EC_COMMAND_PORT, WR_EC)?;
        self.wait_input_empty()?;
        self.io.outb(EC_DATA_PORT, address)?;
        self.wait_input_empty()?;
        self.io.outb(EC_DATA_PORT, value)?;
        self.wait_input_empty()?;

        trace!("EC write 0x{:02X} <- 0x{:02X}", address, value);
        Ok(())
    }

    /// Read a little-endian 16-bit value spread over two consecutive registers
    pub fn ec_read_u16(&self, register: u16) -> Result<u16> {
        let lo = self.ec_read(register)?;
        let hi = self.ec_read(register.wrapping_add(1))?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn wait_input_empty(&self) -> Result<()> {
        self.poll_status(|status| status & STATUS_IBF == 0, "input buffer empty")
    }

    fn wait_output_full(&self) -> Result<()> {
        self.poll_status(|status| status & STATUS_OBF != 0, "output buffer full")
    }

    fn poll_status(&self, ready: impl Fn(u8) -> bool, condition: &'static str) -> Result<()> {
        for attempt in 0..POLL_BUDGET {
            let status = self.io.inb(EC_COMMAND_PORT)?;
            if ready(status) {
                return Ok(());
            }
            if attempt + 1 < POLL_BUDGET {
                thread::sleep(POLL_INTERVAL);
            }
        }
        Err(LegionError::EcBusy { port: EC_COMMAND_PORT, condition })
    }
}

fn register_address(register: u16) -> Result<u8> {
    u8::try_from(register).map_err(|_| LegionError::EcAddress(register))
}
