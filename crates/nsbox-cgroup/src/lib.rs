//! nsbox-cgroup: cgroup-backed resource limits for sandboxed children
//!
//! The supervisor talks to this crate through the [`CgroupDriver`] trait.
//! The v2 implementation drives controller delegation on a unified
//! hierarchy; the v1 implementation covers legacy split hierarchies.

pub mod driver;
pub mod parse;
pub mod v1;
pub mod v2;

pub use driver::{detect_cgroupv2, driver_for, CgroupDriver, CgroupLimits, CgroupStats};
pub use v1::CgroupV1Driver;
pub use v2::CgroupV2Driver;
