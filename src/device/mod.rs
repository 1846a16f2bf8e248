//! # MSI Remapping Code
//!
//! This module contains the MSI descriptor model and the tables that bind guest-visible
//! descriptors to the descriptors programmed into passthrough devices. It should never depend on
//! hypervisor or Linux specific parts.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod arena;
pub mod msi_receiver;
pub mod pci;
pub mod remap_table;
