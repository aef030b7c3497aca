//! Plain-text attribute helpers
//!
//! Capability files are ASCII decimal integers, comma-separated integer
//! lists (fan curve), or kernel CPU range lists such as `0-3,8,10-11`.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use lg_error::{LegionError, Result};

/// Read an attribute with surrounding whitespace removed
pub fn read_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| LegionError::FileRead { path: path.to_path_buf(), source: e })
}

pub fn write_string(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| LegionError::FileWrite { path: path.to_path_buf(), source: e })
}

/// Read and parse a single decimal value
pub fn read_value<T>(path: &Path) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let content = read_string(path)?;
    content
        .parse::<T>()
        .map_err(|e| LegionError::parse(path, format!("'{}': {}", content, e)))
}

/// `0`/`1` attribute
pub fn read_bool(path: &Path) -> Result<bool> {
    match read_value::<u8>(path)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(LegionError::parse(path, format!("expected 0 or 1, got {}", other))),
    }
}

pub fn write_bool(path: &Path, value: bool) -> Result<()> {
    write_string(path, if value { "1" } else { "0" })
}

/// Parse a comma-separated byte list into exactly `N` values
pub fn parse_byte_list<const N: usize>(raw: &str) -> std::result::Result<[u8; N], String> {
    let values: Vec<u8> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u8>().map_err(|e| format!("'{}': {}", s, e)))
        .collect::<std::result::Result<_, _>>()?;

    <[u8; N]>::try_from(values.as_slice())
        .map_err(|_| format!("expected {} values, got {}", N, values.len()))
}

pub fn read_byte_list<const N: usize>(path: &Path) -> Result<[u8; N]> {
    let content = read_string(path)?;
    parse_byte_list(&content).map_err(|reason| LegionError::parse(path, reason))
}

pub fn write_byte_list(path: &Path, values: &[u8]) -> Result<()> {
    let joined = values.iter().map(u8::to_string).collect::<Vec<_>>().join(",");
    write_string(path, &joined)
}

/// Expand a kernel CPU list (`0-3,8`) into CPU numbers
pub fn parse_cpu_ranges(raw: &str) -> std::result::Result<Vec<u32>, String> {
    let mut cpus = Vec::new();
    for part in raw.trim().split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.parse().map_err(|_| format!("bad range start '{}'", part))?;
                let hi: u32 = hi.parse().map_err(|_| format!("bad range end '{}'", part))?;
                if hi < lo {
                    return Err(format!("inverted range '{}'", part));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| format!("bad CPU number '{}'", part))?),
        }
    }
    Ok(cpus)
}

/// Number of CPUs listed in a range file
pub fn read_cpu_count(path: &Path) -> Result<u16> {
    let content = read_string(path)?;
    let cpus = parse_cpu_ranges(&content).map_err(|reason| LegionError::parse(path, reason))?;
    u16::try_from(cpus.len()).map_err(|_| LegionError::parse(path, "CPU count does not fit in u16"))
}
