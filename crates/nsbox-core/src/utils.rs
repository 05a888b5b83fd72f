//! Utility functions for sandbox operations

use crate::error::{Result, SandboxError};
#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
thread_local! {
    static ROOT_OVERRIDE: Cell<Option<bool>> = const { Cell::new(None) };
}

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(test)]
    {
        if let Some(value) = ROOT_OVERRIDE.with(|cell| cell.get()) {
            return value;
        }
    }

    unsafe { libc::geteuid() == 0 }
}

/// Get current effective UID
pub fn get_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Get current effective GID
pub fn get_gid() -> u32 {
    unsafe { libc::getegid() }
}

/// Ensure we have root privileges
pub fn require_root() -> Result<()> {
    if !is_root() {
        Err(SandboxError::PermissionDenied(
            "This operation requires root privileges".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Parse memory size string (e.g., "100M", "1G")
pub fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if s.ends_with('G') {
        (&s[..s.len() - 1], 1024u64 * 1024 * 1024)
    } else if s.ends_with('M') {
        (&s[..s.len() - 1], 1024u64 * 1024)
    } else if s.ends_with('K') {
        (&s[..s.len() - 1], 1024u64)
    } else if s.ends_with('B') {
        (&s[..s.len() - 1], 1u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| SandboxError::ConfigInvalid(format!("Invalid memory size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| SandboxError::ConfigInvalid(format!("Memory size overflow: {}", s)))
}

#[cfg(test)]
pub fn set_root_override(value: Option<bool>) {
    ROOT_OVERRIDE.with(|cell| cell.set(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_bytes() {
        assert_eq!(parse_memory_size("100").unwrap(), 100);
        assert_eq!(parse_memory_size("100B").unwrap(), 100);
    }

    #[test]
    fn test_parse_memory_size_kilobytes() {
        assert_eq!(parse_memory_size("1K").unwrap(), 1024);
        assert_eq!(parse_memory_size("10K").unwrap(), 10 * 1024);
    }

    #[test]
    fn test_parse_memory_size_megabytes() {
        assert_eq!(parse_memory_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_size("256M").unwrap(), 256 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_gigabytes() {
        assert_eq!(parse_memory_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_lowercase() {
        assert_eq!(parse_memory_size("1m").unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert!(parse_memory_size("abc").is_err());
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("12X").is_err());
    }

    #[test]
    fn test_parse_memory_size_overflow() {
        assert!(parse_memory_size("999999999999999G").is_err());
    }

    #[test]
    fn test_root_override() {
        set_root_override(Some(true));
        assert!(is_root());
        assert!(require_root().is_ok());
        set_root_override(Some(false));
        assert!(!is_root());
        assert!(require_root().is_err());
        set_root_override(None);
    }
}
