//! Common types used across the VM subsystem
//!
//! This module defines shared types to avoid circular dependencies.

/// Virtual address.
pub type Vaddr = u64;

/// Physical address.
pub type Paddr = u64;

/// Sentinel for "no physical address".
pub const PADDR_INVALID: Paddr = u64::MAX;

/// Fixed-capacity name attached to objects and address spaces.
pub type Name = heapless::String<32>;

/// Build a [`Name`], truncating at the capacity boundary.
pub fn make_name(s: &str) -> Name {
    let mut name = Name::new();
    for ch in s.chars() {
        if name.push(ch).is_err() {
            break;
        }
    }
    name
}

// ============================================================================
// Errors
// ============================================================================

/// VM operation errors.
///
/// These are error *kinds*: every VM API reports failure synchronously with
/// one of these, and none of them is a panic condition. Caller contract
/// violations (unpin imbalance, double free) assert instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Physical page or bookkeeping allocation failed.
    OutOfMemory,
    /// No suitable gap in the address-space window.
    NoSpace,
    /// Offset/length outside the object or window.
    OutOfRange,
    /// Malformed argument (unaligned, zero-length, oversized).
    InvalidArgs,
    /// Operation not valid for the object's or aspace's current state.
    BadState,
    /// No region or page at the given address.
    NotFound,
    /// Access type disallowed by the mapping's protection.
    AccessDenied,
    /// Range contains pinned pages that may not be discarded.
    PagesPinned,
    /// User-pointer copy faulted and could not be resolved.
    Fault,
}

/// Result alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_name_truncates() {
        let name = make_name("kernel");
        assert_eq!(name.as_str(), "kernel");

        let long = make_name("a-name-well-beyond-the-thirty-two-byte-capacity");
        assert_eq!(long.len(), 32);
    }
}
