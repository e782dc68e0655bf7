//! Resource pressure of the host running the balancer.

use sysinfo::System;

/// Samples CPU and memory usage as fractions in `[0, 1]`.
///
/// CPU usage is measured between consecutive samples, so the first
/// reading after construction is usually zero.
pub struct LocalPressure {
    system: System,
}

impl std::fmt::Debug for LocalPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPressure").finish_non_exhaustive()
    }
}

impl Default for LocalPressure {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPressure {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self { system }
    }

    /// `(cpu, memory)` fractions.
    pub fn sample(&mut self) -> (f64, f64) {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu = f64::from(self.system.global_cpu_info().cpu_usage()) / 100.0;
        let total = self.system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64
        };
        (cpu.clamp(0.0, 1.0), memory.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_fractions() {
        let mut pressure = LocalPressure::new();
        let (cpu, memory) = pressure.sample();
        assert!((0.0..=1.0).contains(&cpu));
        assert!((0.0..=1.0).contains(&memory));
    }
}
