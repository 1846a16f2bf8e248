//! Data model and lookup structures for virtualizing PCI MSIs of passthrough devices.
//!
//! See [`device::remap_table::RemapTable`] for a starting point.

pub mod device;
