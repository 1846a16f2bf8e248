//! # PCI Constants
//!
//! This module collects the constants of the PCI MSI capability structure. All definitions are
//! derived from the "PCI Local Bus Specification" and, for the address and data layout, from
//! the Intel SDM Vol 3. Chapter 10.11 "Message Signalled Interrupts".

// Allow missing docs to avoid duplicating the PCI spec for all constants.
#![allow(missing_docs)]

/// Constants related to the configuration space.
pub mod config_space {

    /// IDs for PCI Capabilities.
    pub mod capability_id {
        pub const MSI: u8 = 0x05;
    }

    /// Constants for the MSI capability.
    ///
    /// The capability is handled as four dwords. The first dword contains the generic capability
    /// header in its low half and the message control register in its high half.
    pub mod msi {
        /// Size of the capability in bytes.
        pub const SIZE: usize = 16;

        /// Number of dwords in the capability.
        pub const WORDS: usize = SIZE / 4;

        /// The maximum number of messages a single function can request.
        pub const MAX_MESSAGES: u8 = 32;

        /// The offset of the capability header and message control register.
        pub const CONTROL: u64 = 0;
        /// The offset of the lower address part.
        pub const ADDRESS_LOW: u64 = 4;
        /// The offset of the high address part of a 64 bit address. Holds the data field when
        /// the device only supports 32 bit addresses.
        pub const ADDRESS_HIGH: u64 = 8;
        /// The offset of the data field of a device with 64 bit addresses.
        pub const DATA: u64 = 12;

        /// Constants for the Control field, as seen in the first dword.
        pub mod control {
            pub const ENABLE: u32 = 1 << 16;

            pub const MULTIPLE_MESSAGE_CAPABLE: u32 = 0x000E_0000;
            pub const MULTIPLE_MESSAGE_CAPABLE_SHIFT: u32 = 17;

            pub const MULTIPLE_MESSAGE_ENABLE: u32 = 0x0070_0000;
            pub const MULTIPLE_MESSAGE_ENABLE_SHIFT: u32 = 20;

            pub const ADDRESS_64_BIT: u32 = 1 << 23;
            pub const PER_VECTOR_MASKING: u32 = 1 << 24;
        }

        /// Constants for the lower address field.
        pub mod address {
            pub const DESTINATION_MODE: u32 = 1 << 2;
            pub const REDIRECTION_HINT: u32 = 1 << 3;

            pub const DESTINATION_ID: u32 = 0x000F_F000;
            pub const DESTINATION_ID_SHIFT: u32 = 12;
        }

        /// Constants for the data field.
        pub mod data {
            pub const VECTOR: u32 = 0xFF;

            pub const DELIVERY_MODE: u32 = 0x700;
            pub const DELIVERY_MODE_SHIFT: u32 = 8;

            pub const LEVEL: u32 = 1 << 14;
            pub const TRIGGER_MODE: u32 = 1 << 15;
        }
    }
}
