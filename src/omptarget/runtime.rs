use crate::config::{Config, MappingMode};
use crate::error::{OffloadError, OffloadResult};
use crate::mm::{DeviceAllocator, FreeOutcome};
use crate::omptarget::device::Device;
use crate::perf::{PerfEvent, PerfRecord};
use crate::rtl::{DeviceAddr, DeviceBackend, HostAddr};
use crate::rtt::{ProgramCache, RawMemory, RootArgument, TypeDescriptor};
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything one offload runtime owns: its devices, the per-call-site program cache, the
/// device-shadow allocator and the perf record.
///
/// Devices are initialized lazily by [`RuntimeState::device`].
pub struct RuntimeState {
    config: Config,
    backend: Arc<dyn DeviceBackend>,
    devices: Vec<Device>,
    programs: ProgramCache,
    allocator: Option<Arc<Mutex<DeviceAllocator>>>,
    perf: Option<Arc<PerfRecord>>,
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .field("programs", &self.programs.len())
            .finish_non_exhaustive()
    }
}

impl RuntimeState {
    /// Set up a runtime for `num_devices` devices of `backend`.
    ///
    /// Unified mode shares host memory with the device and gets no allocator; every other
    /// mode reserves the shadow window up front.
    ///
    /// # Errors
    /// Fails when the shadow window cannot be reserved.
    pub fn new(
        config: Config,
        backend: Arc<dyn DeviceBackend>,
        num_devices: i32,
    ) -> OffloadResult<Self> {
        let perf = config.perf.then(|| Arc::new(PerfRecord::new()));
        let allocator = if config.mode == MappingMode::Unified {
            None
        } else {
            let alloc = DeviceAllocator::new(backend.clone(), config.allocator_config())?;
            log::debug!("Shadow window: {:?}", alloc.layout());
            Some(Arc::new(Mutex::new(alloc)))
        };

        let devices = (0..num_devices.max(0))
            .map(|id| Device::new(id, backend.clone(), &config, perf.clone(), allocator.clone()))
            .collect::<OffloadResult<Vec<_>>>()?;

        log::debug!(
            "Runtime with {} device(s) in {} mode",
            devices.len(),
            config.mode.name()
        );
        Ok(Self {
            config,
            backend,
            devices,
            programs: ProgramCache::new(),
            allocator,
            perf,
        })
    }

    /// Runtime configured from the environment.
    ///
    /// # Errors
    /// See [`RuntimeState::new`].
    pub fn from_env(backend: Arc<dyn DeviceBackend>, num_devices: i32) -> OffloadResult<Self> {
        Self::new(Config::from_env(), backend, num_devices)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    #[must_use]
    pub const fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    #[must_use]
    pub fn perf(&self) -> Option<&PerfRecord> {
        self.perf.as_deref()
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    fn device_slot(&self, id: i32) -> OffloadResult<&Device> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.devices.get(idx))
            .ok_or(OffloadError::InvalidDeviceId(id))
    }

    /// The device with `id`, initialized on first use.
    ///
    /// # Errors
    /// Unknown ids and failed initialization.
    pub fn device(&self, id: i32) -> OffloadResult<&Device> {
        let dev = self.device_slot(id)?;
        dev.init_once()?;
        Ok(dev)
    }

    #[must_use]
    pub fn device_is_ready(&self, id: i32) -> bool {
        self.device(id).is_ok()
    }

    fn lock_allocator(&self) -> OffloadResult<MutexGuard<'_, DeviceAllocator>> {
        self.allocator
            .as_ref()
            .ok_or(OffloadError::Unsupported(self.config.mode.name()))?
            .lock()
            .map_err(|_| OffloadError::General("allocator lock poisoned".into()))
    }

    /// Start routing [`RuntimeState::allocate`] to a fresh context for `device_id`. Returns
    /// the context id.
    ///
    /// # Errors
    /// Unknown devices, unified mode, and exhausted slices.
    pub fn malloc_begin(&self, device_id: i32) -> OffloadResult<usize> {
        self.device_slot(device_id)?;
        let id = self.lock_allocator()?.begin(device_id)?;
        log::debug!("Context {id} opened for device {device_id}");
        Ok(id)
    }

    /// # Errors
    /// Unified mode.
    pub fn malloc_end(&self) -> OffloadResult<()> {
        self.lock_allocator()?.end();
        Ok(())
    }

    /// Allocate device-shadow memory in the active context.
    ///
    /// # Errors
    /// No active context, or heap growth failed.
    pub fn allocate(&self, size: usize) -> OffloadResult<HostAddr> {
        self.lock_allocator()?.allocate(size)
    }

    /// Release an address. Anything not handed out by [`RuntimeState::allocate`] is reported
    /// as [`FreeOutcome::NotOwned`] for the caller to free itself.
    #[must_use]
    pub fn free(&self, addr: HostAddr) -> FreeOutcome {
        self.lock_allocator()
            .map_or(FreeOutcome::NotOwned, |alloc| alloc.free(addr))
    }

    /// Move an engine-owned block into a larger (or smaller) one. `None` when `addr` is not
    /// engine-owned.
    ///
    /// # Errors
    /// Allocation failures.
    pub fn reallocate(&self, addr: HostAddr, size: usize) -> OffloadResult<Option<HostAddr>> {
        self.lock_allocator()?.reallocate(addr, size)
    }

    /// Device address mirroring an engine-owned address.
    #[must_use]
    pub fn shadow_translate(&self, addr: HostAddr) -> Option<DeviceAddr> {
        self.lock_allocator().ok()?.translate(addr)
    }

    /// Copy the used part of context `ctx` to its device.
    ///
    /// # Errors
    /// Unknown contexts and transfer failures.
    pub fn submit_context(&self, ctx: usize) -> OffloadResult<()> {
        let _t = self.perf().map(|p| p.start(PerfEvent::HostToDevice));
        self.lock_allocator()?.submit(ctx)
    }

    /// Copy the used part of context `ctx` back from its device.
    ///
    /// # Errors
    /// Unknown contexts and transfer failures.
    pub fn retrieve_context(&self, ctx: usize) -> OffloadResult<()> {
        let _t = self.perf().map(|p| p.start(PerfEvent::DeviceToHost));
        self.lock_allocator()?.retrieve(ctx)
    }

    /// Deep-copy map of a host structure onto `device_id`.
    ///
    /// # Safety
    /// Every host range reachable from `root` through `desc` must be readable for the whole
    /// mapping lifetime.
    ///
    /// # Errors
    /// Invalid descriptors and map types, mapping conflicts, transfer failures.
    pub unsafe fn map_nested(
        &self,
        device_id: i32,
        desc: &TypeDescriptor,
        root: RootArgument,
    ) -> OffloadResult<Option<DeviceAddr>> {
        let dev = self.device(device_id)?;
        // SAFETY: forwarded from the caller.
        unsafe {
            let memory = RawMemory::new();
            dev.map_nested(&self.programs, desc, root, &memory)
        }
    }

    /// Undo [`RuntimeState::map_nested`].
    ///
    /// # Safety
    /// Every host range reachable from `root` through `desc` must be writable.
    ///
    /// # Errors
    /// Invalid descriptors and transfer failures.
    pub unsafe fn unmap_nested(
        &self,
        device_id: i32,
        desc: &TypeDescriptor,
        root: RootArgument,
    ) -> OffloadResult<()> {
        let dev = self.device(device_id)?;
        // SAFETY: forwarded from the caller.
        unsafe {
            let memory = RawMemory::new();
            dev.unmap_nested(&self.programs, desc, root, &memory)
        }
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        if let Some(perf) = &self.perf {
            perf.dump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{AllocatorConfig, HeapPlacement};
    use crate::rtl::LoopbackBackend;
    use crate::rtt::{MapType, RttCode};
    use crate::utils::WORD_SIZE;

    fn runtime(mode: MappingMode) -> (Arc<LoopbackBackend>, RuntimeState) {
        let backend = Arc::new(LoopbackBackend::new(2));
        let config = Config::default()
            .with_mode(mode)
            .with_perf(true)
            .with_allocator(AllocatorConfig {
                slice_bits: 32,
                max_contexts: 2,
                ..AllocatorConfig::default()
            });
        let rt = RuntimeState::new(config, backend.clone(), 2).unwrap();
        (backend, rt)
    }

    #[test]
    fn devices_are_checked_and_initialized_lazily() {
        let (_, rt) = runtime(MappingMode::Direct);
        assert_eq!(rt.num_devices(), 2);
        assert!(matches!(rt.device(2), Err(OffloadError::InvalidDeviceId(2))));
        assert!(matches!(rt.device(-1), Err(OffloadError::InvalidDeviceId(-1))));
        assert!(!rt.device_slot(1).unwrap().is_initialized());
        assert!(rt.device_is_ready(1));
        assert!(rt.device_slot(1).unwrap().is_initialized());
    }

    #[test]
    fn shadow_memory_round_trip() {
        let (backend, rt) = runtime(MappingMode::Direct);
        assert!(matches!(rt.allocate(16), Err(OffloadError::NoActiveContext)));

        let ctx = rt.malloc_begin(0).unwrap();
        let addr = rt.allocate(64).unwrap();
        rt.malloc_end().unwrap();
        assert_eq!(rt.config().allocator_config().placement, HeapPlacement::Table);

        // SAFETY: freshly allocated 64-byte block.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0xab, 64) };
        rt.submit_context(ctx).unwrap();
        let dev = rt.shadow_translate(addr).unwrap();
        assert_eq!(backend.peek(0, dev, 4).unwrap(), vec![0xab; 4]);

        backend.poke(0, dev, &[1, 2, 3, 4]).unwrap();
        rt.retrieve_context(ctx).unwrap();
        // SAFETY: the block is still live.
        let head = unsafe { std::slice::from_raw_parts(addr as *const u8, 4) };
        assert_eq!(head, [1, 2, 3, 4]);

        let perf = rt.perf().unwrap();
        assert_eq!(perf.stats(PerfEvent::HostToDevice).count, 1);
        assert_eq!(perf.stats(PerfEvent::DeviceToHost).count, 1);

        assert!(matches!(rt.free(addr), FreeOutcome::Leaked { .. }));
        let local = 0u64;
        assert_eq!(rt.free(std::ptr::from_ref(&local) as usize), FreeOutcome::NotOwned);
    }

    #[test]
    fn reallocate_keeps_contents() {
        let (_, rt) = runtime(MappingMode::Direct);
        rt.malloc_begin(1).unwrap();
        let addr = rt.allocate(8).unwrap();
        // SAFETY: freshly allocated 8-byte block.
        unsafe { (addr as *mut u64).write_unaligned(0x1122_3344) };

        let moved = rt.reallocate(addr, 256).unwrap().unwrap();
        assert_ne!(moved, addr);
        // SAFETY: the new block holds at least 8 bytes.
        assert_eq!(unsafe { (moved as *const u64).read_unaligned() }, 0x1122_3344);

        let local = 0u8;
        assert_eq!(rt.reallocate(std::ptr::from_ref(&local) as usize, 8).unwrap(), None);
    }

    #[test]
    fn unified_mode_has_no_allocator() {
        let (_, rt) = runtime(MappingMode::Unified);
        assert!(matches!(
            rt.malloc_begin(0),
            Err(OffloadError::Unsupported("unified"))
        ));
        assert_eq!(rt.free(0x1000), FreeOutcome::NotOwned);
    }

    #[test]
    fn masking_maps_shadow_memory_in_place() {
        let (backend, rt) = runtime(MappingMode::Masking);
        assert_eq!(rt.config().allocator_config().placement, HeapPlacement::Masked);
        rt.malloc_begin(0).unwrap();
        let shadow = rt.allocate(32).unwrap();
        let expected = rt.shadow_translate(shadow).unwrap();

        let dev = rt.device(0).unwrap();
        let before = backend.stats(0).unwrap().allocations;
        // SAFETY: freshly allocated 32-byte block.
        let mapped = unsafe { dev.map_region(shadow, shadow, 32, MapType::TO) }.unwrap();
        assert_eq!(mapped, Some(expected));
        assert_eq!(backend.stats(0).unwrap().allocations, before);

        // SAFETY: as above.
        assert!(unsafe { dev.unmap_region(shadow, 32, MapType::empty()) }.unwrap());
        assert!(backend.live_allocations(0).unwrap() > 0);
    }

    #[test]
    fn programs_are_compiled_once_per_call_site() {
        let (backend, rt) = runtime(MappingMode::Bulk);
        let desc = TypeDescriptor::new(
            vec![RttCode::TID | 3, RttCode::PTR, RttCode::PTR, RttCode::BUILTIN],
            vec![2 * WORD_SIZE, 8],
        )
        .unwrap();
        let values = [[1u64], [2u64]];
        let ptrs = [values[0].as_ptr() as usize, values[1].as_ptr() as usize];
        let base = ptrs.as_ptr() as usize;
        let root = RootArgument {
            begin: base,
            base,
            size: 2 * WORD_SIZE,
            map_type: MapType::TO | MapType::NESTED | MapType::TARGET_PARAM,
        };

        // SAFETY: all reachable ranges are live locals.
        unsafe { rt.map_nested(1, &desc, root) }.unwrap();
        let dev = rt.device(1).unwrap();
        // SAFETY: as above.
        assert_eq!(unsafe { dev.end_phase() }.unwrap(), 2);
        // SAFETY: as above.
        unsafe { rt.unmap_nested(1, &desc, root) }.unwrap();
        // SAFETY: as above.
        unsafe { rt.map_nested(1, &desc, root) }.unwrap();
        assert_eq!(rt.programs().len(), 1);

        let perf = rt.perf().unwrap();
        assert_eq!(perf.stats(PerfEvent::Runtime).count, 3);
        assert_eq!(perf.stats(PerfEvent::UpdatePtr).count, 2);
        assert!(backend.stats(1).unwrap().submits > 0);
        assert_eq!(backend.stats(0).unwrap(), Default::default());
    }
}
