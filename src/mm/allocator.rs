use crate::error::{OffloadError, OffloadResult};
use crate::mm::context::{HeapSource, MmContext};
use crate::mm::layout::AddressLayout;
use crate::mm::region::AddressReservation;
use crate::mm::AllocatorConfig;
use crate::rtl::{DeviceAddr, DeviceBackend};
use std::ptr;
use std::sync::Arc;

/// What `free` did with an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeOutcome {
    /// The address is not engine-owned; the caller's own allocator must release it.
    NotOwned,
    /// The block stays marked in use. Blocks are never reclaimed.
    Leaked { size: usize },
}

/// Next-fit allocator handing out device-shadow memory from per-context heaps.
///
/// Every context owns one slice of a reserved host window (see [`AddressLayout`]), so the
/// owning context of any address is found from its tag bits alone. Freed blocks are not
/// reused.
pub struct DeviceAllocator {
    backend: Arc<dyn DeviceBackend>,
    config: AllocatorConfig,
    layout: AddressLayout,
    reservation: AddressReservation,
    contexts: Vec<MmContext>,
    active: Option<usize>,
}

impl std::fmt::Debug for DeviceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("config", &self.config)
            .field("layout", &self.layout)
            .field("contexts", &self.contexts.len())
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl DeviceAllocator {
    /// Reserve the shadow window and set up an allocator with no contexts yet.
    ///
    /// # Errors
    /// Returns an error if no window of `config.max_contexts` slices can be reserved.
    pub fn new(backend: Arc<dyn DeviceBackend>, config: AllocatorConfig) -> OffloadResult<Self> {
        let config = config.normalized();
        let (layout, reservation) =
            AddressReservation::reserve_window(config.slice_bits, config.max_contexts)?;

        Ok(Self {
            backend,
            config,
            layout,
            reservation,
            contexts: Vec::new(),
            active: None,
        })
    }

    #[must_use]
    pub const fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    #[must_use]
    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Whether `addr` was (or could have been) handed out by this allocator.
    #[must_use]
    pub const fn is_device_shadow(&self, addr: usize) -> bool {
        self.layout.is_device_shadow(addr)
    }

    fn source(&self) -> HeapSource<'_> {
        HeapSource {
            backend: self.backend.as_ref(),
            reservation: &self.reservation,
            layout: &self.layout,
            placement: self.config.placement,
            growth: self.config.growth,
        }
    }

    /// Create a context for `device_id` and route subsequent allocations to it.
    ///
    /// # Errors
    /// Fails when every slice is taken or the first heap cannot be set up.
    pub fn begin(&mut self, device_id: i32) -> OffloadResult<usize> {
        let id = self.contexts.len();
        if id >= self.layout.slices() {
            return Err(OffloadError::AddressSpaceExhausted);
        }
        let ctx = MmContext::create(id, device_id, self.config.first_heap_pages, self.source())?;
        self.contexts.push(ctx);
        self.active = Some(id);
        Ok(id)
    }

    /// Stop routing allocations to the active context.
    pub const fn end(&mut self) {
        self.active = None;
    }

    #[must_use]
    pub const fn active(&self) -> Option<usize> {
        self.active
    }

    #[must_use]
    pub fn context(&self, id: usize) -> Option<&MmContext> {
        self.contexts.get(id)
    }

    /// The context whose heaps contain `addr`.
    #[must_use]
    pub fn context_of(&self, addr: usize) -> Option<&MmContext> {
        let idx = self.layout.slice_index(addr)?;
        self.contexts.get(idx).filter(|ctx| ctx.contains(addr))
    }

    /// Allocate `size` bytes in the active context.
    ///
    /// # Errors
    /// Fails without an active context, or when growing the context's heaps fails.
    pub fn allocate(&mut self, size: usize) -> OffloadResult<usize> {
        let id = self.active.ok_or(OffloadError::NoActiveContext)?;
        self.allocate_in(id, size)
    }

    fn allocate_in(&mut self, id: usize, size: usize) -> OffloadResult<usize> {
        let src = HeapSource {
            backend: self.backend.as_ref(),
            reservation: &self.reservation,
            layout: &self.layout,
            placement: self.config.placement,
            growth: self.config.growth,
        };
        let ctx = self
            .contexts
            .get_mut(id)
            .ok_or(OffloadError::NoActiveContext)?;
        ctx.allocate(size, src)
    }

    /// Release an address. Only engine-owned addresses are intercepted, and their blocks are
    /// leaked rather than reclaimed.
    #[must_use]
    pub fn free(&self, addr: usize) -> FreeOutcome {
        if !self.is_device_shadow(addr) {
            return FreeOutcome::NotOwned;
        }
        let size = self
            .context_of(addr)
            .and_then(|ctx| ctx.payload_capacity(addr))
            .unwrap_or(0);
        log::debug!("free({addr:#x}): {size:#x} bytes leaked");
        FreeOutcome::Leaked { size }
    }

    /// Move an engine-owned block into a fresh block of `size` bytes in the same context.
    /// Returns `None` for addresses this allocator does not own.
    ///
    /// # Errors
    /// Fails when the new block cannot be allocated.
    pub fn reallocate(&mut self, addr: usize, size: usize) -> OffloadResult<Option<usize>> {
        let Some(ctx) = self.context_of(addr) else {
            return Ok(None);
        };
        let id = ctx.id();
        let old = ctx.payload_capacity(addr).unwrap_or(0);

        let new = self.allocate_in(id, size)?;
        // SAFETY: both blocks are live, committed and disjoint.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, new as *mut u8, old.min(size)) };
        Ok(Some(new))
    }

    /// Device address mirroring a shadow address.
    #[must_use]
    pub fn translate(&self, addr: usize) -> Option<DeviceAddr> {
        self.context_of(addr)?.translate(addr)
    }

    /// Copy the in-use part of every heap of context `id` to the device.
    ///
    /// # Errors
    /// Propagates backend allocation and transfer failures.
    pub fn submit(&mut self, id: usize) -> OffloadResult<()> {
        let ctx = self
            .contexts
            .get_mut(id)
            .ok_or(OffloadError::NoActiveContext)?;
        ctx.submit(self.backend.as_ref())
    }

    /// Copy the in-use part of every heap of context `id` back from the device.
    ///
    /// # Errors
    /// Propagates backend transfer failures.
    pub fn retrieve(&mut self, id: usize) -> OffloadResult<()> {
        let ctx = self
            .contexts
            .get_mut(id)
            .ok_or(OffloadError::NoActiveContext)?;
        ctx.retrieve(self.backend.as_ref())
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        for ctx in &mut self.contexts {
            ctx.release(self.backend.as_ref());
        }
    }
}
