use crate::error::{OffloadError, OffloadResult};
use crate::rtt::types::TypeDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Terminal job at the head of every program.
    End,
    /// Emits the caller's root range and seeds the first pointer array.
    RootRegion,
    /// Emits the range one pointer slot points to.
    DataTransfer,
    /// Steps through an array of pointers.
    UpdatePtr,
    /// Struct levels; nothing to emit.
    Skip,
}

/// How a job's bound is derived from the descriptor sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBinding {
    None,
    /// `sizes[k]` bytes.
    Bytes(usize),
    /// `sizes[k] / word` pointer slots.
    Slots(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttJob {
    pub kind: JobKind,
    pub size: SizeBinding,
    /// Pointer levels between the root and the ranges this job emits.
    pub level: usize,
}

/// A compiled deep-copy traversal, shared read-only by every invocation of a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttProgram {
    id: u32,
    jobs: Vec<RttJob>,
}

impl RttProgram {
    /// Compile the type codes of `desc` into a job list.
    ///
    /// The first code is the argument itself and must be a pointer. A second pointer yields a
    /// root region plus the array walk over it; every further pointer adds a transfer plus
    /// another array walk; structs become skips and a builtin ends the chain with a transfer.
    ///
    /// # Errors
    /// Returns `InvalidDescriptor` for chains that do not start with two pointers or contain
    /// unknown codes.
    pub fn compile(desc: &TypeDescriptor) -> OffloadResult<Self> {
        let mut codes = desc.type_codes().iter();

        if !codes.next().is_some_and(|c| c.is_ptr()) {
            return Err(OffloadError::InvalidDescriptor(format!(
                "type {}: argument is not a pointer",
                desc.id()
            )));
        }
        if !codes.next().is_some_and(|c| c.is_ptr()) {
            return Err(OffloadError::InvalidDescriptor(format!(
                "type {}: argument does not point to pointers",
                desc.id()
            )));
        }

        let mut jobs = vec![RttJob {
            kind: JobKind::End,
            size: SizeBinding::None,
            level: 0,
        }];
        let mut k = 0;
        let mut level = 0;

        jobs.push(RttJob {
            kind: JobKind::RootRegion,
            size: SizeBinding::Bytes(k),
            level,
        });
        jobs.push(RttJob {
            kind: JobKind::UpdatePtr,
            size: SizeBinding::Slots(k),
            level,
        });
        k += 1;
        level += 1;

        for code in codes {
            if code.is_ptr() {
                jobs.push(RttJob {
                    kind: JobKind::DataTransfer,
                    size: SizeBinding::Bytes(k),
                    level,
                });
                jobs.push(RttJob {
                    kind: JobKind::UpdatePtr,
                    size: SizeBinding::Slots(k),
                    level,
                });
                k += 1;
                level += 1;
            } else if code.is_struct() {
                jobs.push(RttJob {
                    kind: JobKind::Skip,
                    size: SizeBinding::None,
                    level,
                });
            } else if code.is_builtin() {
                jobs.push(RttJob {
                    kind: JobKind::DataTransfer,
                    size: SizeBinding::Bytes(k),
                    level,
                });
                break;
            } else {
                return Err(OffloadError::InvalidDescriptor(format!(
                    "type {}: unknown code {:#x}",
                    desc.id(),
                    code.0
                )));
            }
        }

        Ok(Self { id: desc.id(), jobs })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn jobs(&self) -> &[RttJob] {
        &self.jobs
    }

    /// Descriptor sizes this program reads.
    #[must_use]
    pub fn sizes_needed(&self) -> usize {
        self.jobs
            .iter()
            .filter_map(|j| match j.size {
                SizeBinding::Bytes(k) | SizeBinding::Slots(k) => Some(k + 1),
                SizeBinding::None => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn dump(&self) {
        log::debug!("RTT program #{}:", self.id);
        for job in &self.jobs {
            log::debug!("\t{:?} {:?} level {}", job.kind, job.size, job.level);
        }
    }
}

/// Compiled programs keyed by call-site id.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: RwLock<HashMap<u32, Arc<RttProgram>>>,
}

impl ProgramCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached program for `desc`'s call site, compiling it on first use.
    ///
    /// # Errors
    /// Propagates compile errors; nothing is cached for a descriptor that fails.
    pub fn get_or_compile(&self, desc: &TypeDescriptor) -> OffloadResult<Arc<RttProgram>> {
        let id = desc.id();
        if let Some(program) = self.get(id) {
            return Ok(program);
        }

        let program = Arc::new(RttProgram::compile(desc)?);
        program.dump();

        let mut programs = self
            .programs
            .write()
            .map_err(|_| OffloadError::General("program cache poisoned".into()))?;
        // Another thread may have compiled the same call site meanwhile; keep the first.
        Ok(programs.entry(id).or_insert(program).clone())
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<RttProgram>> {
        self.programs.read().ok()?.get(&id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.programs.read().map(|p| p.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
