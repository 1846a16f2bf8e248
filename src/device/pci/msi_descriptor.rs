//! # MSI Descriptor
//!
//! The in-memory image of a MSI capability. See [`MsiDescriptor`].

use thiserror::Error;

use crate::device::{arena::DeviceHandle, msi_receiver::MsiMessage};

use super::{
    constants::config_space::msi,
    msi_codec::{self, DestinationMode, TriggerMode},
};

/// Selects one of the four dwords of the MSI capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsiWord {
    /// Capability header and message control register.
    Control = 0,

    /// Lower 32 bits of the message address.
    AddressLow = 1,

    /// Upper 32 bits of the message address. Devices with 32-bit addressing keep their message
    /// data here instead.
    AddressHigh = 2,

    /// Message data of devices with 64-bit addressing.
    Data = 3,
}

/// An attempt was made to convert an index into a [`MsiWord`] that does not exist.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("MSI capability has no dword with index {index}")]
pub struct IllegalMsiWord {
    /// The offending index.
    pub index: usize,
}

impl TryFrom<usize> for MsiWord {
    type Error = IllegalMsiWord;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(Self::Control),
            1 => Ok(Self::AddressLow),
            2 => Ok(Self::AddressHigh),
            3 => Ok(Self::Data),
            _ => Err(IllegalMsiWord { index }),
        }
    }
}

impl MsiWord {
    /// All dwords of the capability in register order.
    pub const ALL: [Self; 4] = [
        Self::Control,
        Self::AddressLow,
        Self::AddressHigh,
        Self::Data,
    ];

    /// Map a byte offset into the MSI capability to the dword at this offset.
    ///
    /// Returns `None` for offsets that are not dword-aligned or lie outside of the capability.
    #[must_use]
    pub fn at_offset(offset: u64) -> Option<Self> {
        match offset {
            msi::CONTROL => Some(Self::Control),
            msi::ADDRESS_LOW => Some(Self::AddressLow),
            msi::ADDRESS_HIGH => Some(Self::AddressHigh),
            msi::DATA => Some(Self::Data),
            _ => None,
        }
    }

    /// The byte offset of this dword in the MSI capability.
    #[must_use]
    pub const fn offset(self) -> u64 {
        self as u64 * 4
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// The register image of a MSI capability plus a reference to the device that owns it.
///
/// Fields are decoded on demand via [`msi_codec`]. The location of the data field depends on the
/// 64-bit addressing bit in the control word: it lives in [`MsiWord::Data`] when 64-bit
/// addressing is active and in [`MsiWord::AddressHigh`] otherwise. [`data`](Self::data) and
/// [`set_data`](Self::set_data) always select the same dword.
///
/// No validation happens here. Any bit pattern is representable, admission control is done by
/// [`validate`](super::validate::validate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsiDescriptor {
    reg: [u32; msi::WORDS],
    owner: Option<DeviceHandle>,
}

impl MsiDescriptor {
    /// Create a disabled descriptor with all dwords zero and no owning device.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reg: [0; msi::WORDS],
            owner: None,
        }
    }

    /// Create a disabled descriptor with all dwords zero that belongs to `owner`.
    #[must_use]
    pub const fn for_device(owner: DeviceHandle) -> Self {
        Self {
            reg: [0; msi::WORDS],
            owner: Some(owner),
        }
    }

    /// Create a descriptor from raw dwords.
    #[must_use]
    pub const fn from_words(reg: [u32; msi::WORDS], owner: Option<DeviceHandle>) -> Self {
        Self { reg, owner }
    }

    /// The raw dwords of the capability.
    #[must_use]
    pub const fn words(&self) -> [u32; msi::WORDS] {
        self.reg
    }

    /// The device this descriptor belongs to.
    #[must_use]
    pub const fn owner(&self) -> Option<DeviceHandle> {
        self.owner
    }

    /// Read a single raw dword.
    #[must_use]
    pub const fn word(&self, word: MsiWord) -> u32 {
        self.reg[word.index()]
    }

    /// Replace a single raw dword.
    pub fn write(&mut self, word: MsiWord, value: u32) {
        self.reg[word.index()] = value;
    }

    /// Whether MSI is enabled in the control word.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        msi_codec::is_enabled(self.reg[0])
    }

    /// Whether the device uses 64-bit message addresses.
    #[must_use]
    pub const fn is_64bit(&self) -> bool {
        msi_codec::is_64bit(self.reg[0])
    }

    /// Whether the device can mask individual messages.
    #[must_use]
    pub const fn per_vector_masking(&self) -> bool {
        msi_codec::per_vector_masking(self.reg[0])
    }

    /// The number of messages the device can request.
    #[must_use]
    pub const fn nr_msg_capable(&self) -> u32 {
        msi_codec::nr_msg_capable(self.reg[0])
    }

    /// The number of messages allocated to the device.
    #[must_use]
    pub const fn nr_msg_enabled(&self) -> u32 {
        msi_codec::nr_msg_enabled(self.reg[0])
    }

    /// Set the enable bit in the control word.
    pub fn enable(&mut self) {
        self.reg[0] = msi_codec::enable(self.reg[0]);
    }

    /// Clear the enable bit in the control word.
    pub fn disable(&mut self) {
        self.reg[0] = msi_codec::disable(self.reg[0]);
    }

    /// The 8-bit destination ID from the lower address dword.
    #[must_use]
    pub const fn destid(&self) -> u8 {
        msi_codec::destid(self.reg[1])
    }

    /// The destination mode from the lower address dword.
    #[must_use]
    pub const fn dest_mode(&self) -> DestinationMode {
        msi_codec::dest_mode(self.reg[1])
    }

    /// The redirection hint from the lower address dword.
    #[must_use]
    pub const fn redir_hint(&self) -> bool {
        msi_codec::redir_hint(self.reg[1])
    }

    /// The interrupt vector from the data dword.
    #[must_use]
    pub const fn vector(&self) -> u8 {
        msi_codec::vector(self.data())
    }

    /// The delivery mode from the data dword.
    #[must_use]
    pub const fn deliv_mode(&self) -> u8 {
        msi_codec::deliv_mode(self.data())
    }

    /// The level bit from the data dword.
    #[must_use]
    pub const fn trigger_level(&self) -> bool {
        msi_codec::trigger_level(self.data())
    }

    /// The trigger mode from the data dword.
    #[must_use]
    pub const fn trigger_mode(&self) -> TriggerMode {
        msi_codec::trigger_mode(self.data())
    }

    /// The message address.
    ///
    /// With 32-bit addressing only the lower address dword counts, regardless of what is stored
    /// in the upper one.
    #[must_use]
    pub const fn addr(&self) -> u64 {
        let low = self.reg[1] as u64;

        if self.is_64bit() {
            low | (self.reg[2] as u64) << 32
        } else {
            low
        }
    }

    const fn data_index(&self) -> usize {
        if self.is_64bit() {
            MsiWord::Data.index()
        } else {
            MsiWord::AddressHigh.index()
        }
    }

    /// The message data dword.
    #[must_use]
    pub const fn data(&self) -> u32 {
        self.reg[self.data_index()]
    }

    /// Write the message data dword.
    ///
    /// The addressing mode bit must already reflect the intended layout. The value is not moved
    /// when the addressing mode changes later.
    pub fn set_data(&mut self, value: u32) {
        let index = self.data_index();
        self.reg[index] = value;
    }

    /// The address/data pair this descriptor makes the device send.
    #[must_use]
    pub const fn message(&self) -> MsiMessage {
        // MSI data is a 16-bit register, the upper half of the dword is reserved.
        MsiMessage::new(self.addr(), (self.data() & 0xFFFF) as u16)
    }
}
