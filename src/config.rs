use crate::mm::{AllocatorConfig, HeapGrowth, HeapPlacement};
use crate::utils::page_size;
use std::env;

/// How host ranges get device storage. Chosen once per runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MappingMode {
    /// Every mapped range gets its own backend allocation.
    #[default]
    Direct,
    /// Ranges are merged into segments transferred at the end of a phase.
    Bulk,
    /// Bulk transfer, and kernels translate host pointers through a device-side table.
    AddressTranslate,
    /// Engine-allocated host memory mirrors device offsets; translation is by address bits.
    Masking,
    /// Host and device share one address space; nothing is copied.
    Unified,
}

impl MappingMode {
    /// Collapse the individual toggles. Unified wins over masking, masking over address
    /// translation, address translation over plain bulk.
    #[must_use]
    pub const fn from_toggles(bulk: bool, at: bool, mask: bool, uvm: bool) -> Self {
        if uvm {
            Self::Unified
        } else if mask {
            Self::Masking
        } else if at {
            Self::AddressTranslate
        } else if bulk {
            Self::Bulk
        } else {
            Self::Direct
        }
    }

    #[must_use]
    pub const fn is_bulk(self) -> bool {
        matches!(self, Self::Bulk | Self::AddressTranslate)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Bulk => "bulk",
            Self::AddressTranslate => "address-translate",
            Self::Masking => "masking",
            Self::Unified => "unified",
        }
    }
}

/// Runtime configuration, normally read from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub mode: MappingMode,
    /// Dump maps and tables after every phase.
    pub verbose: bool,
    pub perf: bool,
    /// Bulk ranges closer than this many bytes are merged.
    pub page_threshold: usize,
    pub allocator: AllocatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: MappingMode::default(),
            verbose: false,
            perf: false,
            page_threshold: page_size(),
            allocator: AllocatorConfig::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a configuration from a variable lookup. A toggle is on when the variable is set
    /// to anything but `0`, `false` or `off`. Unparsable numbers keep their defaults.
    #[must_use]
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let toggle = |key: &str| {
            lookup(key).is_some_and(|v| {
                !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off")
            })
        };
        let number = |key: &str| {
            let raw = lookup(key)?;
            raw.trim()
                .parse::<usize>()
                .inspect_err(|_| log::warn!("Ignoring {key}={raw}: not a number"))
                .ok()
        };

        let mut config = Self {
            mode: MappingMode::from_toggles(
                toggle("OMP_BULK"),
                toggle("OMP_AT"),
                toggle("OMP_MASK"),
                toggle("OMP_UVM"),
            ),
            verbose: toggle("OMP_DC_VERBOSE"),
            perf: toggle("PERF"),
            ..Self::default()
        };

        if let Some(threshold) = number("OMP_DC_PAGE_THRESHOLD") {
            config.page_threshold = threshold;
        }
        if let Some(bits) = number("OMP_DC_SLICE_BITS") {
            match u32::try_from(bits) {
                Ok(bits) if (12..48).contains(&bits) => config.allocator.slice_bits = bits,
                _ => log::warn!("Ignoring OMP_DC_SLICE_BITS={bits}: out of range"),
            }
        }
        if let Some(pages) = number("OMP_DC_HEAP_PAGES") {
            config.allocator.first_heap_pages = pages;
        }
        if let Some(growth) = lookup("OMP_DC_HEAP_GROWTH") {
            match growth.trim().to_ascii_lowercase().as_str() {
                "inplace" | "in-place" => config.allocator.growth = HeapGrowth::InPlace,
                "relocate" => config.allocator.growth = HeapGrowth::Relocate,
                other => log::warn!("Ignoring OMP_DC_HEAP_GROWTH={other}"),
            }
        }
        config
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: MappingMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    #[must_use]
    pub const fn with_perf(mut self, perf: bool) -> Self {
        self.perf = perf;
        self
    }

    #[must_use]
    pub const fn with_page_threshold(mut self, threshold: usize) -> Self {
        self.page_threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }

    /// Allocator settings with placement following the mapping mode: masking needs masked
    /// heaps, everything else uses table placement.
    #[must_use]
    pub fn allocator_config(&self) -> AllocatorConfig {
        let placement = if self.mode == MappingMode::Masking {
            HeapPlacement::Masked
        } else {
            HeapPlacement::Table
        };
        AllocatorConfig {
            placement,
            ..self.allocator
        }
        .normalized()
    }

    /// Names of the enabled features, for the startup banner.
    #[must_use]
    pub fn enabled_features(&self) -> Vec<&'static str> {
        let mut features = vec!["Offloading"];
        match self.mode {
            MappingMode::Direct => {}
            MappingMode::Bulk => features.push("BulkTransfer"),
            MappingMode::AddressTranslate => features.extend(["BulkTransfer", "AddrTranslate"]),
            MappingMode::Masking => features.push("Masking"),
            MappingMode::Unified => features.push("UnifiedMemory"),
        }
        if self.perf {
            features.push("OmpProfiling");
        }
        features
    }
}
