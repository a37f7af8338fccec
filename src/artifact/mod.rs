//! Artifact builders.
//!
//! - [`disk`] - Partitioned raw disk images with GRUB or U-Boot, and their
//!   qcow2 conversion

pub mod disk;
