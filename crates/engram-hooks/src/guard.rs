//! Resource preflight.

use sysinfo::System;
use tracing::warn;

use crate::error::{GateError, Result};

/// Currently available memory in MB.
pub fn free_ram_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.available_memory() / (1024 * 1024)
}

/// Check free RAM against the configured floor before heavy work. Below the
/// floor the caller logs and aborts as a no-op.
pub fn memory_preflight(min_free_mb: u64) -> Result<()> {
    let free_mb = free_ram_mb();
    if free_mb < min_free_mb {
        warn!(free_mb, floor_mb = min_free_mb, "memory preflight failed");
        return Err(GateError::ResourceExhausted {
            free_mb,
            floor_mb: min_free_mb,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_passes_with_zero_floor() {
        assert!(memory_preflight(0).is_ok());
    }

    #[test]
    fn preflight_fails_with_absurd_floor() {
        assert!(matches!(
            memory_preflight(u64::MAX / (1024 * 1024)),
            Err(GateError::ResourceExhausted { .. })
        ));
    }
}
