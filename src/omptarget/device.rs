#![allow(clippy::missing_errors_doc)]

use crate::config::{Config, MappingMode};
use crate::error::{OffloadError, OffloadResult};
use crate::mm::DeviceAllocator;
use crate::omptarget::at::TableArgs;
use crate::omptarget::io::DeviceIo;
use crate::omptarget::map::{AddressMap, RefCount, ReleaseResult, TargetPointer};
use crate::omptarget::strategy::{self, BackingStrategy};
use crate::perf::{PerfEvent, PerfRecord};
use crate::rtl::{DeviceAddr, DeviceBackend, HostAddr, OffloadMode};
use crate::rtt::{
    MapType, PointerSource, ProgramCache, Region, RegionKind, RootArgument, RttCursor,
    TypeDescriptor,
};
use crate::utils::WORD_SIZE;
use std::collections::{BTreeMap, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// A pointer field whose device copy must be patched once both ends have device storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendedUpdate {
    /// Host address of the pointer field.
    pub base_location: HostAddr,
    /// Host address the field's pointee starts at.
    pub pointer_value: HostAddr,
    /// Distance from the field's value to the pointee start.
    pub delta: usize,
    /// Base of the structure owning the field.
    pub owning_base: HostAddr,
}

/// A patched pointer field: what the host holds and what the device copy was set to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowPointer {
    pub owning_base: HostAddr,
    pub host_value: usize,
    pub device_location: DeviceAddr,
    pub device_value: DeviceAddr,
}

/// One kernel argument as the host sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    /// A mapped host pointer and the byte size of what it points to.
    Pointer { addr: HostAddr, size: usize },
    /// A by-value argument of `size` bytes.
    Literal { value: usize, size: usize },
}

struct DeviceState {
    map: AddressMap,
    strategy: Box<dyn BackingStrategy>,
}

/// One offload device: its address map, backing strategy and pending pointer patches.
///
/// Locks are always taken in the order updates, state, shadows.
pub struct Device {
    id: i32,
    backend: Arc<dyn DeviceBackend>,
    mode: MappingMode,
    verbose: bool,
    features: Vec<&'static str>,
    perf: Option<Arc<PerfRecord>>,
    init: OnceLock<bool>,
    at_enabled: AtomicBool,
    state: Mutex<DeviceState>,
    updates: Mutex<VecDeque<SuspendedUpdate>>,
    shadows: Mutex<BTreeMap<HostAddr, ShadowPointer>>,
    table_args: Mutex<TableArgs>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("initialized", &self.is_initialized())
            .field("at_enabled", &self.at_enabled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn poisoned<T>(_: T) -> OffloadError {
    OffloadError::General("device lock poisoned".into())
}

impl Device {
    /// # Errors
    /// Fails when the configured mode needs an allocator that was not given.
    pub fn new(
        id: i32,
        backend: Arc<dyn DeviceBackend>,
        config: &Config,
        perf: Option<Arc<PerfRecord>>,
        allocator: Option<Arc<Mutex<DeviceAllocator>>>,
    ) -> OffloadResult<Self> {
        let strategy = strategy::for_mode(config, allocator)?;
        Ok(Self {
            id,
            backend,
            mode: config.mode,
            verbose: config.verbose,
            features: config.enabled_features(),
            perf,
            init: OnceLock::new(),
            at_enabled: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                map: AddressMap::new(),
                strategy,
            }),
            updates: Mutex::new(VecDeque::new()),
            shadows: Mutex::new(BTreeMap::new()),
            table_args: Mutex::new(TableArgs::default()),
        })
    }

    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    #[must_use]
    pub const fn mode(&self) -> MappingMode {
        self.mode
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.init.get().copied().unwrap_or(false)
    }

    /// Whether kernels on this device translate host pointers through the table.
    #[must_use]
    pub fn address_translate_enabled(&self) -> bool {
        self.at_enabled.load(Ordering::Acquire)
    }

    /// Configured features, minus address translation until the backend has accepted it.
    #[must_use]
    pub fn enabled_features(&self) -> Vec<&'static str> {
        let at_off = !self.address_translate_enabled();
        self.features
            .iter()
            .copied()
            .filter(|&f| !(at_off && f == "AddrTranslate"))
            .collect()
    }

    fn io(&self) -> DeviceIo<'_> {
        DeviceIo {
            backend: self.backend.as_ref(),
            device_id: self.id,
            perf: self.perf.as_deref(),
        }
    }

    fn lock_state(&self) -> OffloadResult<MutexGuard<'_, DeviceState>> {
        self.state.lock().map_err(poisoned)
    }

    /// Initialize the device on first use. Every later call reports the first outcome.
    pub fn init_once(&self) -> OffloadResult<()> {
        if *self.init.get_or_init(|| self.init()) {
            Ok(())
        } else {
            Err(OffloadError::Backend(format!(
                "device {} failed to initialize",
                self.id
            )))
        }
    }

    fn init(&self) -> bool {
        if let Err(e) = self.backend.init_device(self.id) {
            log::error!("Failed to init device {}: {e}", self.id);
            return false;
        }

        if self.mode == MappingMode::AddressTranslate {
            match self.backend.set_mode(OffloadMode::AddressTranslate) {
                Ok(()) => self.at_enabled.store(true, Ordering::Release),
                Err(e) => {
                    log::warn!("Device {}: RTL set mode is not supported ({e})", self.id);
                    if let Ok(mut state) = self.state.lock() {
                        state.strategy.set_table_transfer(false);
                    }
                }
            }
        }
        log::info!("[omp-dc] {} Enabled", self.enabled_features().join(" "));
        true
    }

    pub fn get_or_allocate(
        &self,
        begin: HostAddr,
        base: HostAddr,
        size: usize,
        implicit: bool,
        update_ref: bool,
    ) -> OffloadResult<Option<TargetPointer>> {
        let io = self.io();
        let mut state = self.lock_state()?;
        let DeviceState { map, strategy } = &mut *state;
        map.get_or_allocate(begin, base, size, implicit, update_ref, |b, s| {
            strategy.allocate(&io, b, s)
        })
    }

    pub fn release(
        &self,
        begin: HostAddr,
        size: usize,
        update_ref: bool,
    ) -> OffloadResult<ReleaseResult> {
        Ok(self.lock_state()?.map.release(begin, size, update_ref))
    }

    /// Drop a reference, removing the mapping and its storage when none remain.
    pub fn deallocate(&self, begin: HostAddr, size: usize, force: bool) -> OffloadResult<bool> {
        let io = self.io();
        let mut state = self.lock_state()?;
        let DeviceState { map, strategy } = &mut *state;
        map.deallocate(begin, size, force, |entry| strategy.deallocate(&io, entry))
    }

    /// Register user-provided device storage for a host range. Not available in bulk modes,
    /// where the map does not hold real device addresses.
    pub fn associate(&self, begin: HostAddr, device: DeviceAddr, size: usize) -> OffloadResult<()> {
        if self.mode.is_bulk() {
            return Err(OffloadError::Unsupported(self.mode.name()));
        }
        self.lock_state()?.map.associate(begin, device, size)
    }

    pub fn disassociate(&self, begin: HostAddr) -> OffloadResult<()> {
        if self.mode.is_bulk() {
            return Err(OffloadError::Unsupported(self.mode.name()));
        }
        self.lock_state()?.map.disassociate(begin).map(|_| ())
    }

    pub fn ref_count(&self, addr: HostAddr) -> OffloadResult<Option<RefCount>> {
        Ok(self.lock_state()?.map.ref_count(addr))
    }

    fn translate_locked(state: &DeviceState, begin: HostAddr, size: usize) -> Option<DeviceAddr> {
        let hit = state.map.lookup(begin, size);
        let map_hit = hit
            .entry
            .filter(|_| hit.flags.any())
            .map(|e| e.translate(begin));
        state.strategy.resolve(begin, size, map_hit)
    }

    /// Device address a kernel would see for `begin`.
    pub fn translate(&self, begin: HostAddr, size: usize) -> OffloadResult<Option<DeviceAddr>> {
        Ok(Self::translate_locked(&*self.lock_state()?, begin, size))
    }

    /// Map one range, copying it over when `TO` is set and the mapping is new (or `ALWAYS`).
    /// Returns `None` for an unmapped empty range.
    ///
    /// # Safety
    /// `[begin, begin + size)` must be readable.
    pub unsafe fn map_region(
        &self,
        begin: HostAddr,
        base: HostAddr,
        size: usize,
        map_type: MapType,
    ) -> OffloadResult<Option<DeviceAddr>> {
        let io = self.io();
        let mut state = self.lock_state()?;
        let DeviceState { map, strategy } = &mut *state;

        let implicit = map_type.contains(MapType::IMPLICIT);
        let Some(tp) = map.get_or_allocate(begin, base, size, implicit, true, |b, s| {
            strategy.allocate(&io, b, s)
        })?
        else {
            return Ok(None);
        };

        if map_type.contains(MapType::TO) && (tp.is_new || map_type.contains(MapType::ALWAYS)) {
            log::debug!("Moving {size} bytes (hst:{begin:#x}) -> (tgt:{:#x})", tp.device);
            // SAFETY: forwarded from the caller.
            unsafe { strategy.submit(&io, begin, tp.device, size)? };
        }
        Ok(Some(tp.device))
    }

    /// Unmap one range: copy it back when `FROM` is set and this was the last reference (or
    /// `ALWAYS`), and drop the mapping when no references remain (or `DELETE`). Returns
    /// whether the mapping was removed.
    ///
    /// # Safety
    /// `[begin, begin + size)` must be writable.
    pub unsafe fn unmap_region(
        &self,
        begin: HostAddr,
        size: usize,
        map_type: MapType,
    ) -> OffloadResult<bool> {
        let io = self.io();
        let mut state = self.lock_state()?;
        let DeviceState { map, strategy } = &mut *state;

        let force = map_type.contains(MapType::DELETE);
        let ReleaseResult { device, is_last } = map.release(begin, size, true);
        let Some(device) = device else {
            log::debug!("Unmap of {begin:#x}: not mapped");
            return Ok(false);
        };
        let remove = is_last || force;

        if map_type.contains(MapType::FROM) && (remove || map_type.contains(MapType::ALWAYS)) {
            log::debug!("Moving {size} bytes (tgt:{device:#x}) -> (hst:{begin:#x})");
            // SAFETY: forwarded from the caller.
            unsafe { strategy.retrieve(&io, begin, device, size)? };
            // SAFETY: as above; the retrieved bytes carry device pointers in patched fields.
            unsafe { self.restore_shadows(begin, size)? };
        }
        if !remove {
            return Ok(false);
        }
        let removed = map.deallocate(begin, size, force, |entry| strategy.deallocate(&io, entry))?;
        if removed {
            let mut shadows = self.shadows.lock().map_err(poisoned)?;
            let slots: Vec<HostAddr> = shadows
                .range(begin..begin.saturating_add(size))
                .map(|(&slot, _)| slot)
                .collect();
            for slot in slots {
                shadows.remove(&slot);
            }
        }
        Ok(removed)
    }

    /// Put host pointer values back into patched fields inside `[begin, begin + size)`.
    unsafe fn restore_shadows(&self, begin: HostAddr, size: usize) -> OffloadResult<()> {
        let shadows = self.shadows.lock().map_err(poisoned)?;
        let end = begin.saturating_add(size);
        for (&slot, sp) in shadows.range(begin..end) {
            if slot.saturating_add(WORD_SIZE) > end {
                continue;
            }
            log::debug!("Restoring host pointer at {slot:#x} to {:#x}", sp.host_value);
            // SAFETY: the slot lies in the range the caller made writable.
            unsafe { ptr::write_unaligned(slot as *mut usize, sp.host_value) };
        }
        Ok(())
    }

    /// Queue a pointer patch for the end of the phase.
    pub fn suspend_update(&self, update: SuspendedUpdate) -> OffloadResult<()> {
        log::debug!(
            "Suspend update pointer ({:#x}) -> [{:#x}]",
            update.base_location,
            update.pointer_value
        );
        self.updates.lock().map_err(poisoned)?.push_back(update);
        Ok(())
    }

    #[must_use]
    pub fn pending_updates(&self) -> usize {
        self.updates.lock().map(|q| q.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn shadow_pointers(&self) -> Vec<(HostAddr, ShadowPointer)> {
        self.shadows
            .lock()
            .map(|s| s.iter().map(|(&k, &v)| (k, v)).collect())
            .unwrap_or_default()
    }

    /// Apply queued pointer patches in order. A failing patch stays queued.
    pub fn flush_updates(&self) -> OffloadResult<usize> {
        let io = self.io();
        let mut queue = self.updates.lock().map_err(poisoned)?;
        let mut applied = 0;

        while let Some(&update) = queue.front() {
            let _t = self.perf.as_deref().map(|p| p.start(PerfEvent::UpdatePtr));
            let (location, pointee) = {
                let state = self.lock_state()?;
                (
                    Self::translate_locked(&state, update.base_location, WORD_SIZE),
                    Self::translate_locked(&state, update.pointer_value, 1),
                )
            };
            let location = location.ok_or(OffloadError::NotMapped(update.base_location))?;
            let pointee = pointee.ok_or(OffloadError::NotMapped(update.pointer_value))?;
            let host_value = update.pointer_value.wrapping_sub(update.delta);
            let value = pointee.wrapping_sub(update.delta);

            // Identity translations leave nothing to patch.
            if location != update.base_location || value != host_value {
                log::debug!("Update target pointer: {location:#x} to val: {value:#x}");
                io.submit(location, &value.to_ne_bytes())?;
                self.shadows.lock().map_err(poisoned)?.insert(
                    update.base_location,
                    ShadowPointer {
                        owning_base: update.owning_base,
                        host_value,
                        device_location: location,
                        device_value: value,
                    },
                );
            }
            queue.pop_front();
            applied += 1;
        }
        Ok(applied)
    }

    /// Close a mapping phase: deferred transfers first (bulk segments, translation table),
    /// then the queued pointer patches. Returns the number of patches applied.
    ///
    /// # Safety
    /// Every host range mapped on this device must still be readable.
    pub unsafe fn end_phase(&self) -> OffloadResult<usize> {
        {
            let io = self.io();
            let mut state = self.lock_state()?;
            // SAFETY: forwarded from the caller.
            unsafe { state.strategy.end_phase(&io)? };
            if let Some((table, rows)) = state.strategy.table() {
                self.table_args
                    .lock()
                    .map_err(poisoned)?
                    .set_table(table, rows);
            }
        }
        let applied = self.flush_updates()?;
        if self.verbose {
            self.dump();
        }
        Ok(applied)
    }

    /// Map a deep-copy argument: the root range plus every range reachable through its
    /// pointer fields, queueing one patch per field. Returns the root's device address.
    ///
    /// # Safety
    /// Every range the traversal reaches must be readable, and `source` must read the same
    /// memory.
    pub unsafe fn map_nested(
        &self,
        programs: &ProgramCache,
        desc: &TypeDescriptor,
        root: RootArgument,
        source: &dyn PointerSource,
    ) -> OffloadResult<Option<DeviceAddr>> {
        let _t = self.perf.as_deref().map(|p| p.start(PerfEvent::Runtime));
        let program = programs.get_or_compile(desc)?;
        let mut root_device = None;

        for region in RttCursor::new(&program, desc, root, source)? {
            if region.begin == 0 {
                continue;
            }
            // SAFETY: forwarded from the caller.
            let device =
                unsafe { self.map_region(region.begin, region.begin, region.size, region.map_type)? };
            match region.kind {
                RegionKind::Root => root_device = device,
                RegionKind::Nested if device.is_some() => {
                    self.suspend_update(SuspendedUpdate {
                        base_location: region.base,
                        pointer_value: region.begin,
                        delta: 0,
                        owning_base: root.base,
                    })?;
                }
                RegionKind::Nested => {}
            }
        }
        Ok(root_device)
    }

    /// Undo [`Device::map_nested`], innermost ranges first.
    ///
    /// # Safety
    /// Every range the traversal reaches must be writable, and `source` must read the same
    /// memory.
    pub unsafe fn unmap_nested(
        &self,
        programs: &ProgramCache,
        desc: &TypeDescriptor,
        root: RootArgument,
        source: &dyn PointerSource,
    ) -> OffloadResult<()> {
        let _t = self.perf.as_deref().map(|p| p.start(PerfEvent::Runtime));
        let program = programs.get_or_compile(desc)?;
        let regions: Vec<Region> = RttCursor::new(&program, desc, root, source)?
            .filter(|r| r.begin != 0)
            .collect();

        for region in regions.iter().rev() {
            // SAFETY: forwarded from the caller.
            unsafe { self.unmap_region(region.begin, region.size, region.map_type)? };
        }
        Ok(())
    }

    /// Set the placeholder values rewritten kernels pass for the table arguments.
    pub fn set_table_placeholders(&self, fake_size: usize, fake_byte: usize) -> OffloadResult<()> {
        self.table_args
            .lock()
            .map_err(poisoned)?
            .set_placeholders(fake_size, fake_byte);
        Ok(())
    }

    #[must_use]
    pub fn table_args(&self) -> TableArgs {
        self.table_args.lock().map(|t| *t).unwrap_or_default()
    }

    /// Launch a region. Pointer arguments are translated to device addresses, except in
    /// address-translate mode, where kernels get host pointers plus the table.
    pub fn run_region(
        &self,
        entry: usize,
        args: &[KernelArg],
        offsets: &[isize],
    ) -> OffloadResult<()> {
        let values = if self.address_translate_enabled() {
            let table = self.table_args();
            args.iter()
                .map(|arg| match *arg {
                    KernelArg::Pointer { addr, size } => table.pass_arg(addr, size),
                    KernelArg::Literal { value, size } => table.pass_literal(value, size),
                })
                .collect::<Vec<_>>()
        } else {
            let state = self.lock_state()?;
            args.iter()
                .map(|arg| match *arg {
                    KernelArg::Pointer { addr: 0, .. } => Ok(0),
                    KernelArg::Pointer { addr, size } => Self::translate_locked(&state, addr, size)
                        .ok_or(OffloadError::NotMapped(addr)),
                    KernelArg::Literal { value, .. } => Ok(value),
                })
                .collect::<OffloadResult<Vec<_>>>()?
        };

        let _t = self.perf.as_deref().map(|p| p.start(PerfEvent::Kernel));
        self.backend.run_region(self.id, entry, &values, offsets)
    }

    pub fn dump(&self) {
        if let Ok(state) = self.state.lock() {
            log::debug!("Device {} ({}):", self.id, self.mode.name());
            state.map.dump();
            state.strategy.dump();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let io = DeviceIo {
            backend: self.backend.as_ref(),
            device_id: self.id,
            perf: None,
        };
        if let Ok(state) = self.state.get_mut() {
            let DeviceState { map, strategy } = state;
            strategy.release(&io, map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtl::LoopbackBackend;
    use crate::rtt::{RawMemory, RttCode};

    fn device(mode: MappingMode) -> (Arc<LoopbackBackend>, Device) {
        let backend = Arc::new(LoopbackBackend::new(1));
        let config = Config::default().with_mode(mode).with_page_threshold(64);
        let dev = Device::new(0, backend.clone(), &config, None, None).unwrap();
        dev.init_once().unwrap();
        (backend, dev)
    }

    fn tofrom() -> MapType {
        MapType::TO | MapType::FROM
    }

    #[test]
    fn map_then_unmap_copies_both_ways() {
        let (backend, dev) = device(MappingMode::Direct);
        let mut data = [1u32, 2, 3, 4];
        let begin = data.as_mut_ptr() as usize;

        let tgt = unsafe { dev.map_region(begin, begin, 16, tofrom()) }
            .unwrap()
            .unwrap();
        assert_eq!(backend.peek(0, tgt, 4).unwrap(), 1u32.to_ne_bytes());

        // A second map only bumps the count.
        unsafe { dev.map_region(begin, begin, 16, tofrom()) }.unwrap();
        assert_eq!(backend.stats(0).unwrap().submits, 1);
        assert_eq!(dev.ref_count(begin).unwrap().map(RefCount::get), Some(2));

        backend.poke(0, tgt, &9u32.to_ne_bytes()).unwrap();
        assert!(!unsafe { dev.unmap_region(begin, 16, tofrom()) }.unwrap());
        assert_eq!(backend.stats(0).unwrap().retrieves, 0);

        assert!(unsafe { dev.unmap_region(begin, 16, tofrom()) }.unwrap());
        assert_eq!(data[0], 9);
        assert_eq!(backend.live_allocations(0).unwrap(), 0);
    }

    #[test]
    fn association_is_rejected_in_bulk_mode() {
        let (_, dev) = device(MappingMode::Bulk);
        assert!(matches!(
            dev.associate(0x1000, 0x2000, 8),
            Err(OffloadError::Unsupported("bulk"))
        ));
        assert!(dev.disassociate(0x1000).is_err());

        let (_, direct) = device(MappingMode::Direct);
        direct.associate(0x1000, 0x2000, 8).unwrap();
        assert_eq!(direct.translate(0x1004, 4).unwrap(), Some(0x2004));
        direct.disassociate(0x1000).unwrap();
    }

    #[test]
    fn address_translate_needs_backend_support() {
        let backend = Arc::new(LoopbackBackend::new(1).without_mode_support());
        let config = Config::default().with_mode(MappingMode::AddressTranslate);
        let dev = Device::new(0, backend, &config, None, None).unwrap();
        dev.init_once().unwrap();
        assert!(!dev.address_translate_enabled());
        assert_eq!(dev.enabled_features(), vec!["Offloading", "BulkTransfer"]);

        let data = [0u8; 32];
        let begin = data.as_ptr() as usize;
        unsafe { dev.map_region(begin, begin, 32, MapType::TO) }.unwrap();
        unsafe { dev.end_phase() }.unwrap();
        assert_eq!(dev.table_args().table_size, 0);
    }

    #[test]
    fn banner_follows_the_configured_features() {
        let config = Config::default()
            .with_mode(MappingMode::AddressTranslate)
            .with_perf(true);
        let dev = Device::new(0, Arc::new(LoopbackBackend::new(1)), &config, None, None).unwrap();
        assert_eq!(dev.enabled_features(), vec!["Offloading", "BulkTransfer", "OmpProfiling"]);
        dev.init_once().unwrap();
        assert_eq!(dev.enabled_features(), config.enabled_features());

        for mode in [MappingMode::Direct, MappingMode::Bulk, MappingMode::Unified] {
            let (_, dev) = device(mode);
            assert_eq!(dev.enabled_features(), Config::default().with_mode(mode).enabled_features());
        }
    }

    #[test]
    fn address_translate_rewrites_placeholder_args() {
        let (backend, dev) = device(MappingMode::AddressTranslate);
        assert!(dev.address_translate_enabled());
        assert_eq!(backend.mode().unwrap(), OffloadMode::AddressTranslate);
        dev.set_table_placeholders(0x5151, 0x4242).unwrap();

        let data = [7u64; 4];
        let begin = data.as_ptr() as usize;
        unsafe { dev.map_region(begin, begin, 32, MapType::TO) }.unwrap();
        unsafe { dev.end_phase() }.unwrap();

        let args = dev.table_args();
        assert_eq!(args.table_size, 2);
        dev.run_region(
            0xfeed,
            &[
                KernelArg::Pointer { addr: begin, size: 32 },
                KernelArg::Pointer { addr: 0xdead, size: 0x4242 },
                KernelArg::Literal { value: 0x5151, size: 8 },
            ],
            &[0, 0, 0],
        )
        .unwrap();
        let launch = backend.launches(0).unwrap().pop().unwrap();
        assert_eq!(launch.args, vec![begin, args.table, 2]);
        assert_eq!(backend.peek_word(0, args.table).unwrap(), 1);
    }

    #[test]
    fn direct_launch_translates_pointers() {
        let (backend, dev) = device(MappingMode::Direct);
        let data = [0u8; 64];
        let begin = data.as_ptr() as usize;
        let tgt = unsafe { dev.map_region(begin, begin, 64, MapType::TO) }
            .unwrap()
            .unwrap();

        dev.run_region(
            1,
            &[
                KernelArg::Pointer { addr: begin + 8, size: 8 },
                KernelArg::Pointer { addr: 0, size: 0 },
                KernelArg::Literal { value: 42, size: 4 },
            ],
            &[0, 0, 0],
        )
        .unwrap();
        assert_eq!(backend.launches(0).unwrap()[0].args, vec![tgt + 8, 0, 42]);

        assert!(matches!(
            dev.run_region(1, &[KernelArg::Pointer { addr: 0x10, size: 8 }], &[0]),
            Err(OffloadError::NotMapped(0x10))
        ));
    }

    fn int_ptr_array() -> TypeDescriptor {
        TypeDescriptor::new(
            vec![RttCode::TID | 21, RttCode::PTR, RttCode::PTR, RttCode::BUILTIN],
            vec![4 * WORD_SIZE, 4],
        )
        .unwrap()
    }

    fn nested_tofrom() -> MapType {
        MapType::TO | MapType::FROM | MapType::NESTED | MapType::TARGET_PARAM
    }

    fn deep_copy_round_trip(mode: MappingMode) {
        let (backend, dev) = device(mode);
        let programs = ProgramCache::new();
        let mut ints = [10u32, 20, 30, 40];
        let mut ptrs: [usize; 4] = [0; 4];
        for (slot, int) in ptrs.iter_mut().zip(ints.iter_mut()) {
            *slot = ptr::from_mut(int) as usize;
        }
        let host_ptrs = ptrs;
        let base = ptrs.as_mut_ptr() as usize;
        let root = RootArgument {
            begin: base,
            base,
            size: 4 * WORD_SIZE,
            map_type: nested_tofrom(),
        };
        let memory = unsafe { RawMemory::new() };

        let root_dev = unsafe { dev.map_nested(&programs, &int_ptr_array(), root, &memory) }
            .unwrap()
            .unwrap();
        assert_eq!(dev.pending_updates(), 4);
        assert_eq!(unsafe { dev.end_phase() }.unwrap(), 4);
        assert_eq!(dev.pending_updates(), 0);

        let root_dev = dev.translate(base, 4 * WORD_SIZE).unwrap().unwrap_or(root_dev);
        for (i, &host) in host_ptrs.iter().enumerate() {
            let field = backend.peek_word(0, root_dev + i * WORD_SIZE).unwrap();
            let pointee = dev.translate(host, 4).unwrap().unwrap();
            assert_eq!(field, pointee);
            assert_eq!(backend.peek(0, pointee, 4).unwrap(), ints[i].to_ne_bytes());
        }
        assert_eq!(dev.shadow_pointers().len(), 4);

        // The kernel doubles every value.
        for &host in &host_ptrs {
            let pointee = dev.translate(host, 4).unwrap().unwrap();
            let v = u32::from_ne_bytes(backend.peek(0, pointee, 4).unwrap().try_into().unwrap());
            backend.poke(0, pointee, &(v * 2).to_ne_bytes()).unwrap();
        }

        unsafe { dev.unmap_nested(&programs, &int_ptr_array(), root, &memory) }.unwrap();
        assert_eq!(ints, [20, 40, 60, 80]);
        // Host pointer fields survive the copy back.
        assert_eq!(ptrs, host_ptrs);
        assert!(dev.shadow_pointers().is_empty());
    }

    #[test]
    fn deep_copy_round_trip_direct() {
        deep_copy_round_trip(MappingMode::Direct);
    }

    #[test]
    fn deep_copy_round_trip_bulk() {
        deep_copy_round_trip(MappingMode::Bulk);
    }

    #[test]
    fn failed_patch_stays_queued() {
        let (_, dev) = device(MappingMode::Direct);
        dev.suspend_update(SuspendedUpdate {
            base_location: 0x1000,
            pointer_value: 0x2000,
            delta: 0,
            owning_base: 0x1000,
        })
        .unwrap();
        assert!(matches!(
            dev.flush_updates(),
            Err(OffloadError::NotMapped(0x1000))
        ));
        assert_eq!(dev.pending_updates(), 1);
    }

    #[test]
    fn unified_mode_moves_nothing() {
        let (backend, dev) = device(MappingMode::Unified);
        let data = [3u8; 16];
        let begin = data.as_ptr() as usize;
        assert_eq!(
            unsafe { dev.map_region(begin, begin, 16, tofrom()) }.unwrap(),
            Some(begin)
        );
        assert!(unsafe { dev.unmap_region(begin, 16, tofrom()) }.unwrap());
        let stats = backend.stats(0).unwrap();
        assert_eq!((stats.submits, stats.retrieves, stats.allocations), (0, 0, 0));
    }
}
