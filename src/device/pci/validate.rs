//! # MSI Descriptor Admission
//!
//! A descriptor must pass [`validate`] before it is trusted for remapping or loaded into
//! hardware. Validation is a gate, it never corrects a descriptor.

use std::ops::RangeInclusive;

use thiserror::Error;

use super::{msi_codec::TriggerMode, msi_descriptor::MsiDescriptor};

/// The vectors that may be assigned to devices.
///
/// Vectors below 0x20 are reserved for exceptions.
pub const DEVICE_VECTORS: RangeInclusive<u8> = 0x20..=0xFF;

/// The reasons for rejecting a MSI descriptor.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// Level-triggered MSIs are not supported.
    #[error("MSI is not edge-triggered")]
    NotEdgeTriggered,

    /// The descriptor does not belong to any device.
    #[error("MSI descriptor has no owning device")]
    NoOwningDevice,

    /// The vector lies in the reserved range.
    #[error("MSI vector {vector:#04x} is outside of the device vector range")]
    VectorOutOfRange {
        /// The rejected vector.
        vector: u8,
    },
}

/// Check whether `desc` may be installed into the remap table or activated in hardware.
///
/// The checks run in a fixed order, so a level-triggered descriptor is always reported as
/// [`ValidationError::NotEdgeTriggered`] regardless of its other fields.
pub fn validate(desc: &MsiDescriptor) -> Result<(), ValidationError> {
    if desc.trigger_mode() != TriggerMode::Edge {
        return Err(ValidationError::NotEdgeTriggered);
    }

    if desc.owner().is_none() {
        return Err(ValidationError::NoOwningDevice);
    }

    let vector = desc.vector();
    if !DEVICE_VECTORS.contains(&vector) {
        return Err(ValidationError::VectorOutOfRange { vector });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::device::{
        arena::DeviceHandle,
        pci::{
            constants::config_space::msi::{control, data},
            msi_codec,
        },
    };

    fn owner() -> Option<DeviceHandle> {
        Some(DeviceHandle::new(0, 0))
    }

    fn descriptor_with_data(data: u32, owner: Option<DeviceHandle>) -> MsiDescriptor {
        MsiDescriptor::from_words([control::ENABLE, 0xFEE0_0000, data, 0], owner)
    }

    #[test]
    fn edge_triggered_device_vectors_are_accepted() {
        for vector in [0x20, 0x41, 0xFF] {
            assert_eq!(validate(&descriptor_with_data(vector, owner())), Ok(()));
        }
    }

    #[test]
    fn reserved_vectors_are_rejected() {
        for vector in [0x00, 0x1F] {
            assert_eq!(
                validate(&descriptor_with_data(u32::from(vector), owner())),
                Err(ValidationError::VectorOutOfRange { vector })
            );
        }
    }

    #[test]
    fn only_the_low_byte_counts_as_vector() {
        // 0x120 decodes to vector 0x20 with delivery mode 1.
        assert_eq!(validate(&descriptor_with_data(0x120, owner())), Ok(()));
        // 0x210 decodes to vector 0x10.
        assert_eq!(
            validate(&descriptor_with_data(0x210, owner())),
            Err(ValidationError::VectorOutOfRange { vector: 0x10 })
        );
    }

    #[test]
    fn unowned_descriptors_are_rejected() {
        assert_eq!(
            validate(&descriptor_with_data(0x41, None)),
            Err(ValidationError::NoOwningDevice)
        );
    }

    #[test]
    fn data_word_is_selected_by_the_addressing_mode() {
        // With 64-bit addressing, word 2 is the upper address and word 3 holds the data.
        let desc = MsiDescriptor::from_words(
            [control::ENABLE | control::ADDRESS_64_BIT, 0xFEE0_0000, 0x41, 0x05],
            owner(),
        );

        assert_eq!(
            validate(&desc),
            Err(ValidationError::VectorOutOfRange { vector: 0x05 })
        );
    }

    proptest! {
        #[test]
        fn level_triggered_is_always_rejected(words: [u32; 4], has_owner: bool) {
            let owner = has_owner.then(|| DeviceHandle::new(1, 1));
            let mut desc = MsiDescriptor::from_words(words, owner);
            desc.set_data(msi_codec::with_trigger_mode(desc.data(), msi_codec::TriggerMode::Level));

            prop_assert_eq!(validate(&desc), Err(ValidationError::NotEdgeTriggered));
        }

        #[test]
        fn edge_triggered_owned_descriptors_pass_iff_vector_is_in_range(words: [u32; 4]) {
            let mut desc = MsiDescriptor::from_words(words, owner());
            desc.set_data(desc.data() & !data::TRIGGER_MODE);

            prop_assert_eq!(validate(&desc).is_ok(), desc.vector() >= 0x20);
        }
    }
}
