//! WMI method bridge
//!
//! Vendor firmware functions are ACPI methods addressed by a WMI GUID and a
//! numeric method id. Arguments are fixed-size little-endian blobs whose length
//! is known at the call site; the reply is a typed ACPI object.
//!
//! The bridge never coerces between result types: asking for an integer and
//! getting a buffer (or the other way round) is an error even though the
//! firmware call itself went through.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use lg_error::{LegionError, Result};
use tracing::{debug, trace};

/// Lenovo GameZone WMI interface
pub const GUID_GAMEZONE: &str = "887B54E3-DDDC-4B2C-8B88-68A26A8835D0";

/// Lenovo fan method WMI interface
pub const GUID_FAN_METHOD: &str = "92549549-4BDE-4F06-AC04-CE8BF898DBAA";

/// GameZone method ids
pub mod gamezone {
    pub const GET_SMART_FAN_MODE: u32 = 0x2D;
    pub const SET_SMART_FAN_MODE: u32 = 0x2C;
}

/// Fan method ids
pub mod fan_method {
    pub const GET_MAX_SPEED: u32 = 0x03;
}

/// Object returned by an ACPI method evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcpiObject {
    Integer(u64),
    Buffer(Vec<u8>),
    String(String),
    None,
}

impl AcpiObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            AcpiObject::Integer(_) => "integer",
            AcpiObject::Buffer(_) => "buffer",
            AcpiObject::String(_) => "string",
            AcpiObject::None => "none",
        }
    }
}

/// Evaluates a WMI method and returns the raw ACPI result object
#[cfg_attr(test, mockall::automock)]
pub trait AcpiMethod {
    fn evaluate(&self, guid: &str, method_id: u32, args: &[u8]) -> Result<AcpiObject>;
}

impl<A: AcpiMethod + ?Sized> AcpiMethod for Box<A> {
    fn evaluate(&self, guid: &str, method_id: u32, args: &[u8]) -> Result<AcpiObject> {
        (**self).evaluate(guid, method_id, args)
    }
}

/// Typed front-end over an [`AcpiMethod`] backend
pub struct WmiBridge<A: AcpiMethod> {
    backend: A,
}

impl<A: AcpiMethod> WmiBridge<A> {
    pub fn new(backend: A) -> Self {
        Self { backend }
    }

    /// Invoke a method that returns an ACPI integer
    pub fn invoke_u32<const N: usize>(&self, guid: &str, method_id: u32, args: &[u8; N]) -> Result<u32> {
        match self.backend.evaluate(guid, method_id, args)? {
            AcpiObject::Integer(value) => u32::try_from(value)
                .map_err(|_| LegionError::WmiCall(format!("integer result 0x{:X} exceeds 32 bits", value))),
            other => Err(LegionError::WmiTypeMismatch {
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    /// Invoke a method that returns an ACPI buffer, copying at most `out.len()` bytes
    ///
    /// Returns the number of bytes copied.
    pub fn invoke_buffer<const N: usize>(
        &self,
        guid: &str,
        method_id: u32,
        args: &[u8; N],
        out: &mut [u8],
    ) -> Result<usize> {
        match self.backend.evaluate(guid, method_id, args)? {
            AcpiObject::Buffer(data) => {
                let len = data.len().min(out.len());
                out[..len].copy_from_slice(&data[..len]);
                trace!("WMI {} method 0x{:X}: copied {} of {} bytes", guid, method_id, len, data.len());
                Ok(len)
            }
            other => Err(LegionError::WmiTypeMismatch {
                expected: "buffer",
                found: other.type_name(),
            }),
        }
    }

    /// Invoke a method whose result is ignored
    pub fn invoke_void<const N: usize>(&self, guid: &str, method_id: u32, args: &[u8; N]) -> Result<()> {
        let result = self.backend.evaluate(guid, method_id, args)?;
        trace!("WMI {} method 0x{:X} returned {}", guid, method_id, result.type_name());
        Ok(())
    }
}

/// Backend using the `acpi_call` kernel module
///
/// A call is a single write of `<method path> <instance> <method id> b<hex args>`
/// to `/proc/acpi/call`, followed by a read of the textual result.
pub struct AcpiCallBackend {
    call_path: PathBuf,
    methods: HashMap<String, String>,
}

impl AcpiCallBackend {
    /// `methods` maps a WMI GUID to the ACPI path of its `WMxx` method
    pub fn new(call_path: &Path, methods: HashMap<String, String>) -> Self {
        let methods = methods
            .into_iter()
            .map(|(guid, path)| (guid.to_ascii_uppercase(), path))
            .collect();
        Self {
            call_path: call_path.to_path_buf(),
            methods,
        }
    }

    fn method_path(&self, guid: &str) -> Result<&str> {
        self.methods
            .get(&guid.to_ascii_uppercase())
            .map(String::as_str)
            .ok_or_else(|| LegionError::WmiUnknownGuid(guid.to_string()))
    }
}

impl AcpiMethod for AcpiCallBackend {
    fn evaluate(&self, guid: &str, method_id: u32, args: &[u8]) -> Result<AcpiObject> {
        let command = format_call(self.method_path(guid)?, method_id, args);
        debug!("acpi_call: {}", command);

        fs::write(&self.call_path, &command)
            .map_err(|e| LegionError::FileWrite { path: self.call_path.clone(), source: e })?;
        let reply = fs::read_to_string(&self.call_path)
            .map_err(|e| LegionError::FileRead { path: self.call_path.clone(), source: e })?;

        parse_call_result(&reply)
    }
}

/// Build the acpi_call command line for instance 0 of a WMI method
pub fn format_call(method_path: &str, method_id: u32, args: &[u8]) -> String {
    let mut command = format!("{} 0 0x{:X} b", method_path, method_id);
    if args.is_empty() {
        command.push_str("00");
    }
    for byte in args {
        command.push_str(&format!("{:02x}", byte));
    }
    command
}

/// Parse the textual reply of acpi_call into a typed object
pub fn parse_call_result(reply: &str) -> Result<AcpiObject> {
    let reply = reply.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    if let Some(err) = reply.strip_prefix("Error:") {
        return Err(LegionError::WmiCall(err.trim().to_string()));
    }
    if reply.is_empty() || reply == "not called" {
        return Err(LegionError::WmiCall("no result available".into()));
    }
    // Methods without a return statement
    if reply.eq_ignore_ascii_case("null") {
        return Ok(AcpiObject::None);
    }

    if let Some(inner) = reply.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        let mut data = Vec::new();
        for item in inner.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let byte = parse_hex(item)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| LegionError::WmiCall(format!("malformed buffer element '{}'", item)))?;
            data.push(byte);
        }
        return Ok(AcpiObject::Buffer(data));
    }

    if let Some(inner) = reply.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(AcpiObject::String(inner.to_string()));
    }

    if reply.starts_with("0x") {
        return parse_hex(reply)
            .map(AcpiObject::Integer)
            .ok_or_else(|| LegionError::WmiCall(format!("malformed integer '{}'", reply)));
    }

    Err(LegionError::WmiCall(format!("unrecognized result '{}'", reply)))
}

fn parse_hex(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}
