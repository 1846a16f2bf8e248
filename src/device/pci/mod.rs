//! # PCI MSI Capability Handling
//!
//! A MSI capability is four dwords in the PCI Configuration Space of a device. This module
//! contains the [codec](msi_codec) for the fields in these dwords, the
//! [descriptor](msi_descriptor::MsiDescriptor) that holds a capability image and the
//! [admission check](validate::validate) a descriptor has to pass before it is trusted.
//!
//! ## Example
//!
//! ```rust
//! use msiremap::device::pci::{msi_codec, msi_descriptor::{MsiDescriptor, MsiWord}};
//!
//! let mut desc = MsiDescriptor::new();
//! desc.write(MsiWord::Control, msi_codec::enable(0x0080_0005));
//! desc.write(MsiWord::AddressLow, msi_codec::with_destid(0xFEE0_0000, 3));
//! desc.set_data(0x41);
//!
//! assert!(desc.is_64bit());
//! assert_eq!(desc.word(MsiWord::Data), 0x41);
//! assert_eq!(desc.destid(), 3);
//! assert_eq!(desc.vector(), 0x41);
//! ```

pub mod constants;
pub mod msi_codec;
pub mod msi_descriptor;
pub mod validate;
