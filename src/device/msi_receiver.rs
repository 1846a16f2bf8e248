//! # MSI Receiver
//!
//! This module contains a trait [`MsiReceiver`] which allows receiving Message-Signaled Interrupts
//! (MSIs) with custom Address and Data type. The interrupt delivery path of the
//! [`RemapTable`](super::remap_table::RemapTable) hands the guest-visible message of a passthrough
//! assignment to such a receiver, which injects it into the guest.

use std::fmt::Debug;

/// The address/data pair for an MSI.
///
/// The PCI specification makes no limitations here. The interpretation of address and data is
/// entirely platform specific. For x86, refer to the Intel SDM Vol 3. Chapter 10.11 "Message
/// Signalled Interrupts".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    /// The guest physical address where the MSI message is sent to.
    ///
    /// As a rule of thumb, this value determines which CPU the interrupt is routed to.
    pub address: u64,

    /// The payload of the MSI.
    ///
    /// As a rule of thumb, this value determines what interrupt vector is triggered on the selected
    /// CPU.
    pub data: u16,
}

impl MsiMessage {
    /// Create a new [`MsiMessage`] struct.
    #[must_use]
    pub const fn new(address: u64, data: u16) -> Self {
        Self { address, data }
    }

    /// The interrupt vector encoded in the low byte of the data.
    #[must_use]
    pub const fn vector(&self) -> u8 {
        (self.data & 0xFF) as u8
    }
}

/// Trait for all receivers of [`MsiMessage`]s.
///
/// It provides a single function for sending MSIs with a 64-bit address field and a 16-bit data
/// field.
///
/// Guest interrupt injection is supposed to be implemented like this:
///
/// ```
/// use msiremap::device::msi_receiver::{MsiReceiver, MsiMessage};
///
/// #[derive(Debug)]
/// struct GuestApic {
///     injected: std::sync::Mutex<Vec<u8>>,
/// }
///
/// impl MsiReceiver for GuestApic {
///     fn send_msi(&self, msi: MsiMessage) {
///         self.injected.lock().unwrap().push(msi.vector());
///     }
/// }
///
/// let apic = GuestApic { injected: Default::default() };
/// apic.send_msi(MsiMessage::new(0xFEE0_0000, 0x41));
/// assert_eq!(*apic.injected.lock().unwrap(), vec![0x41]);
///```
pub trait MsiReceiver: Debug + Send + Sync {
    /// Sends a single MSI to the receiver.
    fn send_msi(&self, msi: MsiMessage);
}

/// A do-nothing implementation of [`MsiReceiver`] useful for testing or prototyping.
///
/// Any MSIs sent to this receiver are silently dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyMsiReceiver {}

impl DummyMsiReceiver {
    /// Create a new dummy MSI receiver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MsiReceiver for DummyMsiReceiver {
    fn send_msi(&self, _msi: MsiMessage) {
        // The dummy receiver intentionally does nothing when it receives an MSI.
    }
}
