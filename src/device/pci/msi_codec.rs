//! # MSI Register Field Codec
//!
//! Pure bit extraction and packing functions over the raw dwords of a MSI capability. Every bit
//! pattern is a valid input. Decoding never fails, it reports whatever bits are set.
//!
//! The functions are grouped by the dword they operate on:
//!
//! - the capability/control dword (word 0),
//! - the lower address dword (word 1),
//! - the data dword (word 2 or 3, depending on the addressing mode).

use super::constants::config_space::msi::{address, control, data};

/// The destination mode encoded in the MSI address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    /// The destination ID names a single APIC ID.
    Physical,

    /// The destination ID is a logical destination.
    Logical,
}

/// The trigger mode encoded in the MSI data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// A single message is one interrupt event.
    Edge,

    /// The message asserts or deasserts a level.
    Level,
}

const fn flag(value: u32, mask: u32) -> bool {
    value & mask != 0
}

const fn with_flag(value: u32, mask: u32, set: bool) -> u32 {
    if set {
        value | mask
    } else {
        value & !mask
    }
}

/// Return the capability ID from the header in the low byte of the first dword.
#[must_use]
pub const fn capability_id(cap: u32) -> u8 {
    (cap & 0xFF) as u8
}

/// Return the number of messages the function is capable of (1, 2, 4, ...).
#[must_use]
pub const fn nr_msg_capable(cap: u32) -> u32 {
    1 << ((cap & control::MULTIPLE_MESSAGE_CAPABLE) >> control::MULTIPLE_MESSAGE_CAPABLE_SHIFT)
}

/// Return the number of messages software allocated to the function (1, 2, 4, ...).
#[must_use]
pub const fn nr_msg_enabled(cap: u32) -> u32 {
    1 << ((cap & control::MULTIPLE_MESSAGE_ENABLE) >> control::MULTIPLE_MESSAGE_ENABLE_SHIFT)
}

/// Return whether the function uses 64 bit message addresses.
#[must_use]
pub const fn is_64bit(cap: u32) -> bool {
    flag(cap, control::ADDRESS_64_BIT)
}

/// Return whether the function supports masking individual messages.
#[must_use]
pub const fn per_vector_masking(cap: u32) -> bool {
    flag(cap, control::PER_VECTOR_MASKING)
}

/// Return whether MSI is enabled.
#[must_use]
pub const fn is_enabled(cap: u32) -> bool {
    flag(cap, control::ENABLE)
}

/// Return `cap` with the MSI enable bit cleared. All other bits are preserved.
#[must_use]
pub const fn disable(cap: u32) -> u32 {
    cap & !control::ENABLE
}

/// Return `cap` with the MSI enable bit set. All other bits are preserved.
#[must_use]
pub const fn enable(cap: u32) -> u32 {
    cap | control::ENABLE
}

/// Return the destination mode of a lower address dword.
#[must_use]
pub const fn dest_mode(addr: u32) -> DestinationMode {
    if flag(addr, address::DESTINATION_MODE) {
        DestinationMode::Logical
    } else {
        DestinationMode::Physical
    }
}

/// Return `addr` with the destination mode replaced.
#[must_use]
pub const fn with_dest_mode(addr: u32, mode: DestinationMode) -> u32 {
    with_flag(
        addr,
        address::DESTINATION_MODE,
        matches!(mode, DestinationMode::Logical),
    )
}

/// Return the redirection hint of a lower address dword.
#[must_use]
pub const fn redir_hint(addr: u32) -> bool {
    flag(addr, address::REDIRECTION_HINT)
}

/// Return `addr` with the redirection hint replaced.
#[must_use]
pub const fn with_redir_hint(addr: u32, hint: bool) -> u32 {
    with_flag(addr, address::REDIRECTION_HINT, hint)
}

/// Return the 8-bit destination ID of a lower address dword.
#[must_use]
pub const fn destid(addr: u32) -> u8 {
    ((addr & address::DESTINATION_ID) >> address::DESTINATION_ID_SHIFT) as u8
}

/// Return `addr` with the destination ID replaced.
#[must_use]
pub const fn with_destid(addr: u32, id: u8) -> u32 {
    (addr & !address::DESTINATION_ID) | ((id as u32) << address::DESTINATION_ID_SHIFT)
}

/// Return the interrupt vector of a data dword.
#[must_use]
pub const fn vector(data: u32) -> u8 {
    (data & data::VECTOR) as u8
}

/// Return `data` with the interrupt vector replaced.
#[must_use]
pub const fn with_vector(data: u32, vector: u8) -> u32 {
    (data & !data::VECTOR) | vector as u32
}

/// Return the 3-bit delivery mode of a data dword.
#[must_use]
pub const fn deliv_mode(data: u32) -> u8 {
    ((data & data::DELIVERY_MODE) >> data::DELIVERY_MODE_SHIFT) as u8
}

/// Return `data` with the delivery mode replaced. Only the low 3 bits of `mode` are used.
#[must_use]
pub const fn with_deliv_mode(data: u32, mode: u8) -> u32 {
    let mode = ((mode as u32) << data::DELIVERY_MODE_SHIFT) & data::DELIVERY_MODE;

    (data & !data::DELIVERY_MODE) | mode
}

/// Return the level bit of a data dword.
///
/// This bit only has a meaning for level-triggered messages.
#[must_use]
pub const fn trigger_level(data: u32) -> bool {
    flag(data, data::LEVEL)
}

/// Return `data` with the level bit replaced.
#[must_use]
pub const fn with_trigger_level(data: u32, level: bool) -> u32 {
    with_flag(data, data::LEVEL, level)
}

/// Return the trigger mode of a data dword.
#[must_use]
pub const fn trigger_mode(data: u32) -> TriggerMode {
    if flag(data, data::TRIGGER_MODE) {
        TriggerMode::Level
    } else {
        TriggerMode::Edge
    }
}

/// Return `data` with the trigger mode replaced.
#[must_use]
pub const fn with_trigger_mode(data: u32, mode: TriggerMode) -> u32 {
    with_flag(data, data::TRIGGER_MODE, matches!(mode, TriggerMode::Level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ADDRESS_FIELDS: u32 =
        address::DESTINATION_MODE | address::REDIRECTION_HINT | address::DESTINATION_ID;
    const DATA_FIELDS: u32 = data::VECTOR | data::DELIVERY_MODE | data::LEVEL | data::TRIGGER_MODE;

    #[test]
    fn message_counts_are_powers_of_two() {
        assert_eq!(nr_msg_capable(0), 1);
        assert_eq!(nr_msg_enabled(0), 1);

        // MMC = 5, MME = 3
        let cap = (5 << 17) | (3 << 20);
        assert_eq!(nr_msg_capable(cap), 32);
        assert_eq!(nr_msg_enabled(cap), 8);
    }

    #[test]
    fn control_flags_are_decoded() {
        assert!(is_enabled(0x0001_0000));
        assert!(!is_enabled(0xFFFE_FFFF));
        assert!(is_64bit(0x0080_0000));
        assert!(!is_64bit(0xFF7F_FFFF));
        assert!(per_vector_masking(0x0100_0000));
        assert!(!per_vector_masking(0xFEFF_FFFF));
        assert_eq!(capability_id(0x0080_6005), 0x05);
    }

    #[test]
    fn address_fields_are_decoded() {
        let addr = 0xFEE0_000C | (0xA5 << 12);

        assert_eq!(destid(addr), 0xA5);
        assert_eq!(dest_mode(addr), DestinationMode::Logical);
        assert!(redir_hint(addr));

        assert_eq!(dest_mode(0xFEE0_0000), DestinationMode::Physical);
        assert!(!redir_hint(0xFEE0_0000));
    }

    #[test]
    fn data_fields_are_decoded() {
        let data = 0xC000 | (0b101 << 8) | 0x41;

        assert_eq!(vector(data), 0x41);
        assert_eq!(deliv_mode(data), 0b101);
        assert!(trigger_level(data));
        assert_eq!(trigger_mode(data), TriggerMode::Level);

        assert_eq!(trigger_mode(0x41), TriggerMode::Edge);
    }

    #[test]
    fn delivery_mode_is_truncated_to_three_bits() {
        assert_eq!(with_deliv_mode(0, 0xFF), 0x700);
        assert_eq!(with_deliv_mode(0xFFFF_FFFF, 0), 0xFFFF_F8FF);
    }

    proptest! {
        #[test]
        fn enable_and_disable_only_touch_the_enable_bit(v: u32) {
            prop_assert_eq!(enable(v) & !control::ENABLE, v & !control::ENABLE);
            prop_assert_eq!(disable(v) & !control::ENABLE, v & !control::ENABLE);
            prop_assert!(is_enabled(enable(disable(v))));
            prop_assert!(!is_enabled(disable(enable(v))));
            prop_assert_eq!(disable(enable(v)), disable(v));
        }

        #[test]
        fn address_fields_round_trip(v: u32) {
            let packed = with_destid(
                with_redir_hint(with_dest_mode(0, dest_mode(v)), redir_hint(v)),
                destid(v),
            );

            prop_assert_eq!(packed, v & ADDRESS_FIELDS);
        }

        #[test]
        fn data_fields_round_trip(v: u32) {
            let packed = with_trigger_mode(
                with_trigger_level(
                    with_deliv_mode(with_vector(0, vector(v)), deliv_mode(v)),
                    trigger_level(v),
                ),
                trigger_mode(v),
            );

            prop_assert_eq!(packed, v & DATA_FIELDS);
        }

        #[test]
        fn packers_preserve_unrelated_bits(v: u32, id: u8, vec: u8) {
            prop_assert_eq!(
                with_destid(v, id) & !address::DESTINATION_ID,
                v & !address::DESTINATION_ID
            );
            prop_assert_eq!(with_vector(v, vec) & !data::VECTOR, v & !data::VECTOR);
            prop_assert_eq!(destid(with_destid(v, id)), id);
            prop_assert_eq!(vector(with_vector(v, vec)), vec);
        }
    }
}
