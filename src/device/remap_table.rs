//! # MSI Remap Table
//!
//! The remap table binds the root vector of a passthrough MSI assignment to the pair of
//! descriptors that belong to it: the virtual descriptor the guest programs and the physical
//! descriptor that is loaded into the device. See [`RemapTable`].

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::device::{
    arena::{ArenaError, DescriptorRef, DeviceArena, DeviceHandle},
    msi_receiver::MsiReceiver,
    pci::{
        msi_descriptor::MsiDescriptor,
        validate::{validate, ValidationError},
    },
};

/// The vector under which the hypervisor installed the handler for an assignment.
pub type RootVector = u64;

/// The two descriptors of one passthrough MSI assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemapEntry {
    /// The descriptor the guest observes and programs.
    pub virt: DescriptorRef,

    /// The descriptor that is loaded into the device.
    pub phys: DescriptorRef,
}

impl RemapEntry {
    /// Create a new [`RemapEntry`].
    #[must_use]
    pub const fn new(virt: DescriptorRef, phys: DescriptorRef) -> Self {
        Self { virt, phys }
    }

    /// Whether either descriptor belongs to `device`.
    #[must_use]
    pub fn references(&self, device: DeviceHandle) -> bool {
        self.virt.device == device || self.phys.device == device
    }
}

/// The current contents of both descriptors of an assignment.
///
/// The snapshots are taken at lookup time. Each of them is internally consistent even when the
/// descriptor is reprogrammed concurrently. They are not validated again, a descriptor may have
/// been reprogrammed into an invalid state after the entry was installed. Check
/// [`validate`](Self::validate) before acting on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    /// The references the snapshots were taken from.
    pub entry: RemapEntry,

    /// The virtual descriptor.
    pub virt: Arc<MsiDescriptor>,

    /// The physical descriptor.
    pub phys: Arc<MsiDescriptor>,
}

impl ResolvedEntry {
    /// Check that both snapshots still pass validation.
    pub fn validate(&self) -> Result<(), RemapError> {
        validate(&self.virt).map_err(|source| RemapError::Invalid {
            side: Side::Virtual,
            source,
        })?;
        validate(&self.phys).map_err(|source| RemapError::Invalid {
            side: Side::Physical,
            source,
        })
    }
}

/// Which descriptor of an assignment an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The guest-visible descriptor.
    Virtual,

    /// The hardware descriptor.
    Physical,
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Virtual => write!(f, "virtual"),
            Self::Physical => write!(f, "physical"),
        }
    }
}

/// Errors reported by the [`RemapTable`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapError {
    /// The root vector is already bound to a different assignment.
    #[error("root vector {root_vector:#x} is bound to a different assignment")]
    RootVectorInUse {
        /// The requested root vector.
        root_vector: RootVector,
    },

    /// One of the descriptors is already part of an assignment under another root vector.
    #[error("MSI assignment is already installed under root vector {root_vector:#x}")]
    AlreadyInstalled {
        /// The root vector the existing entry is installed under.
        root_vector: RootVector,
    },

    /// The device is being torn down and cannot get new entries.
    #[error("device {0:?} is quiesced")]
    DeviceQuiesced(DeviceHandle),

    /// The device has to be quiesced before its entries can be removed for teardown.
    #[error("device {0:?} has not been quiesced")]
    NotQuiesced(DeviceHandle),

    /// A descriptor did not pass validation.
    #[error("{side} MSI descriptor rejected")]
    Invalid {
        /// The rejected descriptor.
        side: Side,

        /// Why the descriptor was rejected.
        #[source]
        source: ValidationError,
    },

    /// Another remap table already manages the device arena.
    #[error("device arena is managed by another remap table")]
    ArenaInUse,

    /// A descriptor reference could not be resolved.
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Proof that the remap table holds no entries for a device.
///
/// Only [`RemapTable::remove_all_for_device`] creates this token and only
/// [`DeviceArena::destroy`] of the same arena consumes it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "the device can only be destroyed with this token"]
pub struct Deregistered {
    arena: u64,
    device: DeviceHandle,
}

impl Deregistered {
    pub(crate) const fn new(arena: u64, device: DeviceHandle) -> Self {
        Self { arena, device }
    }

    pub(crate) const fn arena(&self) -> u64 {
        self.arena
    }

    /// The device that has been deregistered.
    #[must_use]
    pub const fn device(&self) -> DeviceHandle {
        self.device
    }
}

type EntryMap = HashMap<RootVector, RemapEntry>;

/// The table of active passthrough MSI assignments, keyed by root vector.
///
/// There are two users of this table:
///
/// - the configuration write path, which installs and removes entries when the guest enables,
///   disables or reprograms MSI on a passthrough device,
/// - the interrupt delivery path, which looks up the assignment for an incoming interrupt and
///   injects the guest-visible message.
///
/// Lookups never block: they read an immutable snapshot of the table. Mutations are serialized
/// by a mutex and publish a new snapshot atomically, so a lookup sees either all or none of the
/// changes of a single mutation.
///
/// A table is the only manager of its [`DeviceArena`] until it is dropped.
#[derive(Debug)]
pub struct RemapTable {
    arena: Arc<DeviceArena>,

    /// The authoritative entries. Only touched by writers.
    entries: Mutex<EntryMap>,

    /// The entries as seen by readers.
    published: ArcSwap<EntryMap>,
}

impl RemapTable {
    /// Create an empty table for descriptors in `arena`.
    ///
    /// Fails if another table already manages `arena`.
    pub fn new(arena: Arc<DeviceArena>) -> Result<Self, RemapError> {
        if !arena.claim() {
            return Err(RemapError::ArenaInUse);
        }

        Ok(Self {
            arena,
            entries: Mutex::default(),
            published: ArcSwap::default(),
        })
    }

    /// The arena the descriptors of this table live in.
    #[must_use]
    pub fn arena(&self) -> &Arc<DeviceArena> {
        &self.arena
    }

    fn check_descriptor(&self, side: Side, dref: DescriptorRef) -> Result<(), RemapError> {
        let record = self
            .arena
            .get(dref.device)
            .ok_or(ArenaError::StaleHandle(dref.device))?;

        if record.is_quiesced() {
            return Err(RemapError::DeviceQuiesced(dref.device));
        }

        let desc = record
            .descriptor(dref.slot)
            .ok_or(ArenaError::NoSuchDescriptor(dref))?;

        validate(&desc).map_err(|source| RemapError::Invalid { side, source })
    }

    /// Install the assignment `(virt, phys)` under `root_vector`.
    ///
    /// Both descriptors must belong to live, non-quiesced devices and pass validation. A root
    /// vector that is bound to a different assignment is not rebound. To move an assignment to a
    /// new root vector, [`remove`](Self::remove) it first. Installing the same pair again under
    /// the same root vector is a no-op.
    pub fn insert(
        &self,
        root_vector: RootVector,
        virt: DescriptorRef,
        phys: DescriptorRef,
    ) -> Result<(), RemapError> {
        let entry = RemapEntry::new(virt, phys);
        let mut entries = self.entries.lock().unwrap();

        match entries.get(&root_vector) {
            Some(existing) if *existing == entry => return Ok(()),
            Some(_) => return Err(RemapError::RootVectorInUse { root_vector }),
            None => {}
        }

        if let Some((&other, _)) = entries.iter().find(|(_, e)| {
            e.virt == virt || e.phys == phys || e.virt == phys || e.phys == virt
        }) {
            return Err(RemapError::AlreadyInstalled { root_vector: other });
        }

        self.check_descriptor(Side::Virtual, virt)?;
        self.check_descriptor(Side::Physical, phys)?;

        entries.insert(root_vector, entry);

        // It's okay to use store here, because we only have a single
        // writer (serialized by the mutex).
        self.published.store(Arc::new(entries.clone()));

        debug!("Installed MSI remap entry {root_vector:#x}: {virt:?} -> {phys:?}");
        Ok(())
    }

    /// Return the descriptor references installed under `root_vector`.
    ///
    /// Entries whose devices no longer exist are not returned.
    #[must_use]
    pub fn entry(&self, root_vector: RootVector) -> Option<RemapEntry> {
        let entry = self.published.load().get(&root_vector).copied()?;

        let live = |dref: DescriptorRef| self.arena.get(dref.device).is_some();

        (live(entry.virt) && live(entry.phys)).then_some(entry)
    }

    /// Look up the assignment for `root_vector` and take snapshots of both descriptors.
    ///
    /// This is safe to call from the interrupt delivery path. A miss is not an error, it means
    /// that no passthrough assignment is active for this vector. The snapshots are returned as
    /// they are, see [`ResolvedEntry::validate`].
    #[must_use]
    pub fn lookup(&self, root_vector: RootVector) -> Option<ResolvedEntry> {
        let entry = self.published.load().get(&root_vector).copied()?;

        match (
            self.arena.descriptor(entry.virt),
            self.arena.descriptor(entry.phys),
        ) {
            (Some(virt), Some(phys)) => Some(ResolvedEntry { entry, virt, phys }),
            _ => {
                // Only possible while a teardown races with this lookup.
                debug!("Ignoring stale MSI remap entry {root_vector:#x}");
                None
            }
        }
    }

    /// Remove the entry for `root_vector`.
    ///
    /// Removing an absent entry is a no-op. Returns the removed entry.
    pub fn remove(&self, root_vector: RootVector) -> Option<RemapEntry> {
        let mut entries = self.entries.lock().unwrap();
        let removed = entries.remove(&root_vector)?;

        self.published.store(Arc::new(entries.clone()));

        debug!("Removed MSI remap entry {root_vector:#x}");
        Some(removed)
    }

    /// Remove every entry that references a descriptor of `device`.
    ///
    /// The device must have been [quiesced](DeviceArena::quiesce) before. All entries disappear
    /// in a single step for concurrent lookups. The returned token allows destroying the device
    /// record.
    pub fn remove_all_for_device(&self, device: DeviceHandle) -> Result<Deregistered, RemapError> {
        let record = self
            .arena
            .get(device)
            .ok_or(ArenaError::StaleHandle(device))?;

        if !record.is_quiesced() {
            return Err(RemapError::NotQuiesced(device));
        }

        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();

        entries.retain(|_, entry| !entry.references(device));

        let removed = before - entries.len();
        if removed > 0 {
            self.published.store(Arc::new(entries.clone()));
        }

        debug!(
            "Removed {removed} MSI remap entr{} of device {}",
            if removed == 1 { "y" } else { "ies" },
            record.label()
        );

        Ok(Deregistered::new(self.arena.id(), device))
    }

    /// Deliver an interrupt that arrived on `root_vector` to the guest.
    ///
    /// The guest-visible message of the virtual descriptor is sent to `receiver`. Returns `true` if
    /// a message was sent. Nothing is sent if there is no assignment for `root_vector`, the
    /// guest has MSI disabled, or either descriptor was reprogrammed into a state that no longer
    /// passes validation.
    pub fn deliver(&self, root_vector: RootVector, receiver: &dyn MsiReceiver) -> bool {
        let Some(resolved) = self.lookup(root_vector) else {
            warn!("Spurious interrupt on root vector {root_vector:#x}");
            return false;
        };

        if !resolved.virt.is_enabled() {
            trace!("Guest has MSI disabled for root vector {root_vector:#x}, dropping interrupt");
            return false;
        }

        if let Err(err) = resolved.validate() {
            warn!("Dropping interrupt on root vector {root_vector:#x}: {err:?}");
            return false;
        }

        let message = resolved.virt.message();
        trace!(
            "Injecting vector {:#04x} for root vector {root_vector:#x}",
            message.vector()
        );

        receiver.send_msi(message);
        true
    }

    /// The number of installed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.published.load().len()
    }

    /// Whether no entries are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RemapTable {
    fn drop(&mut self) {
        self.arena.release();
    }
}
