//! # Device Arena
//!
//! Device records that own MSI descriptors live in a [`DeviceArena`] and are addressed by
//! generational [`DeviceHandle`]s. The [remap table](super::remap_table::RemapTable) stores
//! [`DescriptorRef`]s into the arena instead of references, so every lookup can detect a record
//! that has been destroyed in the meantime.
//!
//! Readers never take a lock. The slot vector and each descriptor are published as immutable
//! snapshots via [`ArcSwap`], writers are serialized by mutexes and replace whole snapshots.
//!
//! Tearing down a device follows a fixed order that is enforced by the API:
//!
//! 1. [`DeviceArena::quiesce`] stops physical interrupt delivery for the device,
//! 2. [`RemapTable::remove_all_for_device`](super::remap_table::RemapTable::remove_all_for_device)
//!    removes its table entries and hands out a [`Deregistered`] token,
//! 3. [`DeviceArena::destroy`] consumes the token.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::debug;

use crate::device::{
    pci::{
        constants::config_space::msi::MAX_MESSAGES,
        msi_descriptor::{MsiDescriptor, MsiWord},
        validate::{validate, ValidationError},
    },
    remap_table::Deregistered,
};

/// A handle to a device record in a [`DeviceArena`].
///
/// Handles stay valid until the record is destroyed. Afterwards the slot may be reused, but the
/// generation differs, so old handles are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle {
    index: u32,
    generation: u32,
}

impl DeviceHandle {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The slot index in the arena.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// The generation of the slot this handle was created for.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    fn slot(self) -> usize {
        // u32 always fits into usize on the platforms we run on.
        usize::try_from(self.index).unwrap()
    }
}

/// Names one MSI descriptor of a device record.
///
/// Each message of a multi-message capability has its own descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    /// The owning device.
    pub device: DeviceHandle,

    /// The descriptor slot in the device record.
    pub slot: u8,
}

impl DescriptorRef {
    /// Create a new [`DescriptorRef`].
    #[must_use]
    pub const fn new(device: DeviceHandle, slot: u8) -> Self {
        Self { device, slot }
    }
}

/// Errors reported by the [`DeviceArena`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The handle refers to a record that has been destroyed or never existed.
    #[error("device handle {0:?} is stale")]
    StaleHandle(DeviceHandle),

    /// The device record has no descriptor in the given slot.
    #[error("no MSI descriptor at {0:?}")]
    NoSuchDescriptor(DescriptorRef),

    /// A device must own between one and [`MAX_MESSAGES`] descriptors.
    #[error("invalid number of MSI descriptors: {0}")]
    InvalidDescriptorCount(u8),

    /// The device still delivers physical interrupts.
    #[error("device {0:?} has not been quiesced")]
    NotQuiesced(DeviceHandle),

    /// The updated descriptor did not pass validation and was discarded.
    #[error("MSI descriptor update rejected")]
    Rejected(#[from] ValidationError),

    /// The [`Deregistered`] token was issued for a device of another arena.
    #[error("deregistration of {0:?} was issued by another arena")]
    ForeignToken(DeviceHandle),
}

/// A device record that owns one or more MSI descriptors.
#[derive(Debug)]
pub struct DeviceRecord {
    handle: DeviceHandle,
    label: String,

    /// Published descriptors, one per message.
    descriptors: Box<[ArcSwap<MsiDescriptor>]>,

    /// Serializes updates to the descriptors of this device.
    update_lock: Mutex<()>,

    quiesced: AtomicBool,
}

impl DeviceRecord {
    fn new(handle: DeviceHandle, label: String, descriptor_count: u8) -> Self {
        Self {
            handle,
            label,
            descriptors: (0..descriptor_count)
                .map(|_| ArcSwap::from_pointee(MsiDescriptor::for_device(handle)))
                .collect(),
            update_lock: Mutex::new(()),
            quiesced: AtomicBool::new(false),
        }
    }

    /// The handle of this record.
    #[must_use]
    pub const fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// A human-readable name of the device, usually its PCI address.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The number of descriptors this device owns.
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Return the current snapshot of the descriptor in `slot`.
    #[must_use]
    pub fn descriptor(&self, slot: u8) -> Option<Arc<MsiDescriptor>> {
        self.descriptors
            .get(usize::from(slot))
            .map(|cell| cell.load_full())
    }

    /// Whether physical interrupt delivery for this device has been stopped.
    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }

    /// Apply `f` to a copy of the descriptor in `slot` and publish it if `check` accepts it.
    fn modify<F, C>(&self, slot: u8, f: F, check: C) -> Result<Arc<MsiDescriptor>, ArenaError>
    where
        F: FnOnce(&mut MsiDescriptor),
        C: FnOnce(&MsiDescriptor) -> Result<(), ArenaError>,
    {
        let cell = self
            .descriptors
            .get(usize::from(slot))
            .ok_or(ArenaError::NoSuchDescriptor(DescriptorRef::new(self.handle, slot)))?;

        // The lock guards no data. A panic in an earlier update did not publish anything.
        let _guard = self
            .update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut next = **cell.load();
        f(&mut next);

        // Writers only control the register image, the owner stays with the record.
        let next = MsiDescriptor::from_words(next.words(), Some(self.handle));
        check(&next)?;

        let next = Arc::new(next);
        cell.store(next.clone());

        Ok(next)
    }
}

#[derive(Debug, Clone, Default)]
struct ArenaSlot {
    generation: u32,

    /// The generation counter is exhausted, the slot is never handed out again.
    retired: bool,

    record: Option<Arc<DeviceRecord>>,
}

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(0);

/// The set of device records that own MSI descriptors.
///
/// At most one [`RemapTable`](super::remap_table::RemapTable) manages the entries of an arena at
/// any time, so a [`Deregistered`] token covers every entry that references the device.
#[derive(Debug)]
pub struct DeviceArena {
    id: u64,

    /// Whether a remap table currently manages this arena.
    claimed: AtomicBool,

    /// The authoritative slot list. Only touched by writers.
    slots: Mutex<Vec<ArenaSlot>>,

    /// The slot list as seen by readers.
    published: ArcSwap<Vec<ArenaSlot>>,
}

impl Default for DeviceArena {
    fn default() -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            claimed: AtomicBool::new(false),
            slots: Mutex::default(),
            published: ArcSwap::default(),
        }
    }
}

impl DeviceArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Default::default()
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Returns `false` if another remap table already manages this arena.
    pub(crate) fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Add a device record with `descriptor_count` disabled descriptors.
    ///
    /// One descriptor is needed per MSI message the device may send.
    pub fn add_device(
        &self,
        label: impl Into<String>,
        descriptor_count: u8,
    ) -> Result<DeviceHandle, ArenaError> {
        if !(1..=MAX_MESSAGES).contains(&descriptor_count) {
            return Err(ArenaError::InvalidDescriptorCount(descriptor_count));
        }

        let mut slots = self.slots.lock().unwrap();

        let index = slots
            .iter()
            .position(|slot| slot.record.is_none() && !slot.retired)
            .unwrap_or_else(|| {
                slots.push(ArenaSlot::default());
                slots.len() - 1
            });

        let handle = DeviceHandle::new(
            u32::try_from(index).expect("device arena index overflow"),
            slots[index].generation,
        );
        let record = DeviceRecord::new(handle, label.into(), descriptor_count);
        debug!(
            "Adding device {} as {handle:?} with {descriptor_count} MSI descriptor(s)",
            record.label
        );

        slots[index].record = Some(Arc::new(record));

        // It's okay to use store here, because we only have a single
        // writer (serialized by the mutex).
        self.published.store(Arc::new(slots.clone()));

        Ok(handle)
    }

    /// Return the device record for `handle`, if it still exists.
    #[must_use]
    pub fn get(&self, handle: DeviceHandle) -> Option<Arc<DeviceRecord>> {
        self.published
            .load()
            .get(handle.slot())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.clone())
    }

    fn record(&self, handle: DeviceHandle) -> Result<Arc<DeviceRecord>, ArenaError> {
        self.get(handle).ok_or(ArenaError::StaleHandle(handle))
    }

    /// Return the current snapshot of the referenced descriptor.
    ///
    /// Returns `None` if the device was destroyed or has no such slot.
    #[must_use]
    pub fn descriptor(&self, dref: DescriptorRef) -> Option<Arc<MsiDescriptor>> {
        self.get(dref.device)?.descriptor(dref.slot)
    }

    /// Replace a single raw dword of a descriptor.
    ///
    /// This is the entry point for configuration space writes. The returned descriptor is the
    /// new snapshot.
    pub fn write_word(
        &self,
        dref: DescriptorRef,
        word: MsiWord,
        value: u32,
    ) -> Result<Arc<MsiDescriptor>, ArenaError> {
        self.update(dref, |desc| desc.write(word, value))
    }

    /// Apply `f` to a descriptor and publish the result as a single change.
    ///
    /// Concurrent readers observe either the old or the new descriptor. Use this when several
    /// dwords have to change together, e.g. when the addressing mode flips and the data dword
    /// moves. `f` may replace the whole descriptor, the published result is always owned by the
    /// device record.
    pub fn update<F>(&self, dref: DescriptorRef, f: F) -> Result<Arc<MsiDescriptor>, ArenaError>
    where
        F: FnOnce(&mut MsiDescriptor),
    {
        self.record(dref.device)?.modify(dref.slot, f, |_| Ok(()))
    }

    /// Like [`update`](Self::update), but only publish the result if it passes validation.
    ///
    /// On rejection the previous descriptor stays in place.
    pub fn try_update<F>(&self, dref: DescriptorRef, f: F) -> Result<Arc<MsiDescriptor>, ArenaError>
    where
        F: FnOnce(&mut MsiDescriptor),
    {
        self.record(dref.device)?.modify(dref.slot, f, |desc| {
            validate(desc).map_err(|err| {
                debug!("Rejecting MSI descriptor update for {dref:?}: {err}");
                ArenaError::from(err)
            })
        })
    }

    /// Stop physical interrupt delivery for a device.
    ///
    /// Quiesced devices cannot get new remap table entries. This is the first step of tearing
    /// down a device.
    pub fn quiesce(&self, handle: DeviceHandle) -> Result<(), ArenaError> {
        let record = self.record(handle)?;

        if !record.quiesced.swap(true, Ordering::AcqRel) {
            debug!("Quiesced device {}", record.label);
        }

        Ok(())
    }

    /// Destroy a device record.
    ///
    /// The [`Deregistered`] token proves that the remap table no longer references the device.
    /// Afterwards all handles to the record are stale.
    pub fn destroy(&self, proof: Deregistered) -> Result<(), ArenaError> {
        let handle = proof.device();
        if proof.arena() != self.id {
            return Err(ArenaError::ForeignToken(handle));
        }

        let mut slots = self.slots.lock().unwrap();

        let slot = slots
            .get_mut(handle.slot())
            .filter(|slot| slot.generation == handle.generation && slot.record.is_some())
            .ok_or(ArenaError::StaleHandle(handle))?;

        if let Some(record) = slot.record.as_ref() {
            if !record.is_quiesced() {
                return Err(ArenaError::NotQuiesced(handle));
            }
            debug!("Destroying device {}", record.label);
        }

        slot.record = None;
        match slot.generation.checked_add(1) {
            Some(generation) => slot.generation = generation,
            None => {
                debug!("Retiring arena slot {}", handle.index());
                slot.retired = true;
            }
        }

        self.published.store(Arc::new(slots.clone()));

        Ok(())
    }

    /// The number of live device records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.published
            .load()
            .iter()
            .filter(|slot| slot.record.is_some())
            .count()
    }

    /// Whether the arena holds no device records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;

    use crate::device::pci::constants::config_space::msi::control;

    fn program(desc: &mut MsiDescriptor, vector: u8) {
        desc.write(MsiWord::Control, control::ENABLE);
        desc.write(MsiWord::AddressLow, 0xFEE0_0000);
        desc.set_data(u32::from(vector));
    }

    #[test]
    fn added_devices_own_zeroed_descriptors() {
        let arena = DeviceArena::new();
        let handle = arena.add_device("0000:00:04.0", 2).unwrap();

        let record = arena.get(handle).unwrap();
        assert_eq!(record.handle(), handle);
        assert_eq!(record.label(), "0000:00:04.0");
        assert_eq!(record.descriptor_count(), 2);
        assert!(!record.is_quiesced());

        for slot in 0..2 {
            let desc = arena.descriptor(DescriptorRef::new(handle, slot)).unwrap();
            assert_eq!(desc.words(), [0; 4]);
            assert_eq!(desc.owner(), Some(handle));
        }

        assert_eq!(arena.descriptor(DescriptorRef::new(handle, 2)), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn descriptor_count_is_bounded() {
        let arena = DeviceArena::new();

        assert_eq!(
            arena.add_device("none", 0),
            Err(ArenaError::InvalidDescriptorCount(0))
        );
        assert_eq!(
            arena.add_device("too many", 33),
            Err(ArenaError::InvalidDescriptorCount(33))
        );
        assert!(arena.add_device("max", 32).is_ok());
    }

    #[test]
    fn word_writes_publish_new_snapshots() {
        let arena = DeviceArena::new();
        let dref = DescriptorRef::new(arena.add_device("dev", 1).unwrap(), 0);

        let before = arena.descriptor(dref).unwrap();
        let after = arena
            .write_word(dref, MsiWord::AddressLow, 0xFEE0_1000)
            .unwrap();

        // Old snapshots are not modified in place.
        assert_eq!(before.word(MsiWord::AddressLow), 0);
        assert_eq!(after.word(MsiWord::AddressLow), 0xFEE0_1000);
        assert_eq!(arena.descriptor(dref).unwrap(), after);
    }

    #[test]
    fn writes_to_missing_slots_fail() {
        let arena = DeviceArena::new();
        let dref = DescriptorRef::new(arena.add_device("dev", 1).unwrap(), 1);

        assert_eq!(
            arena.write_word(dref, MsiWord::Control, 0),
            Err(ArenaError::NoSuchDescriptor(dref))
        );
    }

    #[test]
    fn rejected_updates_keep_the_old_descriptor() {
        let arena = DeviceArena::new();
        let dref = DescriptorRef::new(arena.add_device("dev", 1).unwrap(), 0);

        let good = arena.try_update(dref, |desc| program(desc, 0x41)).unwrap();
        assert_eq!(good.vector(), 0x41);

        assert_eq!(
            arena.try_update(dref, |desc| program(desc, 0x10)),
            Err(ArenaError::Rejected(ValidationError::VectorOutOfRange {
                vector: 0x10
            }))
        );
        assert_eq!(arena.descriptor(dref).unwrap(), good);
    }

    #[test]
    fn replaced_descriptors_stay_with_their_device() {
        let arena = DeviceArena::new();
        let handle = arena.add_device("dev", 1).unwrap();
        let dref = DescriptorRef::new(handle, 0);

        let cleared = arena.update(dref, |desc| *desc = MsiDescriptor::new()).unwrap();
        assert_eq!(cleared.owner(), Some(handle));

        // Raw words forwarded from a configuration write carry no owner.
        let raw = [control::ENABLE, 0xFEE0_0000, 0x41, 0];
        let programmed = arena
            .try_update(dref, |desc| *desc = MsiDescriptor::from_words(raw, None))
            .unwrap();
        assert_eq!(programmed.owner(), Some(handle));
        assert_eq!(programmed.words(), raw);
    }

    #[test]
    fn panicking_updates_do_not_block_the_device() {
        let arena = DeviceArena::new();
        let dref = DescriptorRef::new(arena.add_device("dev", 1).unwrap(), 0);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            arena.update(dref, |_| panic!("update failed"))
        }));
        assert!(result.is_err());
        assert_eq!(arena.descriptor(dref).unwrap().words(), [0; 4]);

        let after = arena
            .write_word(dref, MsiWord::AddressLow, 0xFEE0_1000)
            .unwrap();
        assert_eq!(after.word(MsiWord::AddressLow), 0xFEE0_1000);
    }

    #[test]
    fn destroyed_devices_reject_their_handles() {
        let arena = DeviceArena::new();
        let handle = arena.add_device("dev", 1).unwrap();

        arena.quiesce(handle).unwrap();
        arena.destroy(Deregistered::new(arena.id(), handle)).unwrap();

        assert!(arena.get(handle).is_none());
        assert!(arena.is_empty());
        assert_eq!(
            arena.write_word(DescriptorRef::new(handle, 0), MsiWord::Control, 0),
            Err(ArenaError::StaleHandle(handle))
        );
        assert_eq!(arena.quiesce(handle), Err(ArenaError::StaleHandle(handle)));
        assert_eq!(
            arena.destroy(Deregistered::new(arena.id(), handle)),
            Err(ArenaError::StaleHandle(handle))
        );
    }

    #[test]
    fn slots_are_reused_with_a_new_generation() {
        let arena = DeviceArena::new();
        let old = arena.add_device("old", 1).unwrap();

        arena.quiesce(old).unwrap();
        arena.destroy(Deregistered::new(arena.id(), old)).unwrap();

        let new = arena.add_device("new", 1).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert!(arena.get(old).is_none());
        assert_eq!(arena.get(new).unwrap().label(), "new");
    }

    #[test]
    fn exhausted_slots_are_retired() {
        let arena = DeviceArena::new();
        arena.slots.lock().unwrap().push(ArenaSlot {
            generation: u32::MAX,
            ..Default::default()
        });

        let last = arena.add_device("last", 1).unwrap();
        assert_eq!((last.index(), last.generation()), (0, u32::MAX));

        arena.quiesce(last).unwrap();
        arena.destroy(Deregistered::new(arena.id(), last)).unwrap();
        assert!(arena.get(last).is_none());

        let next = arena.add_device("next", 1).unwrap();
        assert_eq!(next.index(), 1);
        assert!(arena.get(last).is_none());
    }

    #[test]
    fn tokens_only_destroy_devices_of_their_arena() {
        let arena = DeviceArena::new();
        let other = DeviceArena::new();
        let handle = arena.add_device("dev", 1).unwrap();
        arena.quiesce(handle).unwrap();

        assert_eq!(
            arena.destroy(Deregistered::new(other.id(), handle)),
            Err(ArenaError::ForeignToken(handle))
        );
        assert!(arena.get(handle).is_some());
    }

    #[test]
    fn devices_must_be_quiesced_before_destruction() {
        let arena = DeviceArena::new();
        let handle = arena.add_device("dev", 1).unwrap();

        assert_eq!(
            arena.destroy(Deregistered::new(arena.id(), handle)),
            Err(ArenaError::NotQuiesced(handle))
        );
        assert!(arena.get(handle).is_some());
    }
}
