//! Bootable device disk image provisioning.
//!
//! Turns a hardware description, a gadget description and a system payload
//! into a partitioned raw disk image with a working bootloader:
//!
//! - **Partition planning** - Declarative layouts resolved to sector ranges and
//!   written with `parted`
//! - **Loop mapping** - Partitions exposed through `kpartx` device-mapper nodes
//! - **Mount sessions** - Formatted partitions mounted under a private root
//! - **Bootloaders** - GRUB (EFI, plus BIOS on PC) or U-Boot with A/B slots
//! - **Variant selection** - Bootloader and layout chosen from the descriptions
//!
//! # Architecture
//!
//! ```text
//! device-image
//!     │
//!     ├── description   hardware.yaml / package.yaml
//!     ├── artifact::disk
//!     │     ├── layout, partitions   plan + parted script
//!     │     ├── mapper, format, mount
//!     │     ├── grub, uboot          Image implementations
//!     │     └── variant              select_image()
//!     └── build
//!           ├── context, privileges  runner + tools + sudo scopes
//!           └── pipeline             build_image()
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use device_image::build::context::BuildContext;
//! use device_image::build::pipeline::{build_image, BuildRequest};
//! use device_image::config::BuildConfig;
//!
//! let config = BuildConfig::load_default()?;
//! let ctx = BuildContext::host(&config);
//! let image = build_image(&ctx, &config, &BuildRequest {
//!     hardware: "hardware.yaml".into(),
//!     gadget: "meta/package.yaml".into(),
//!     payload: "rootfs.tar".into(),
//!     output: "device.img".into(),
//!     size_bytes: 4 << 30,
//!     qcow2: None,
//! })?;
//! ```

pub mod artifact;
pub mod build;
pub mod config;
pub mod description;
pub mod error;
pub mod preflight;
pub mod process;

pub use artifact::disk::{select_image, Bootloader, DiskImage, Image, LayoutName};
pub use build::context::BuildContext;
pub use build::pipeline::{build_image, BuildRequest};
pub use error::{ImageError, Result};
