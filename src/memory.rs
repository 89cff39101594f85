use std::sync::Mutex;
use sysinfo::System;

/// Source of the "available memory" figure that sizes the cache and scan batches.
pub trait MemoryProbe: Send + Sync {
    fn available_bytes(&self) -> u64;
}

pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> u64 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            Err(_) => 0,
        }
    }
}

/// Constant figure, for tests and constrained hosts.
#[derive(Clone, Copy, Debug)]
pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn available_bytes(&self) -> u64 {
        self.0
    }
}

/// `available * fraction / per_item`, clamped to `[min, max]`.
pub fn budget_items(available: u64, fraction: f64, per_item: u64, min: usize, max: usize) -> usize {
    let per_item = per_item.max(1) as f64;
    let items = (available as f64 * fraction / per_item).floor();
    let items = if items.is_finite() && items > 0.0 {
        items as usize
    } else {
        0
    };
    items.clamp(min, max.max(min))
}
