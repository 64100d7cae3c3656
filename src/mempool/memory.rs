use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use sysinfo::{Pid, ProcessesToUpdate, System};

/// 프로세스 메모리 사용량 조회
pub trait MemoryProbe: Send + Sync {
    /// RSS (MB). 조회할 수 없으면 None
    fn used_memory_mb(&self) -> Option<u64>;
}

/// sysinfo 기반 현재 프로세스 RSS
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn used_memory_mb(&self) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system
            .process(self.pid)
            .map(|process| process.memory() / 1024 / 1024)
    }
}

/// 값을 직접 지정하는 probe (테스트, mock 모드)
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    mb: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(mb: u64) -> Self {
        Self { mb: AtomicU64::new(mb) }
    }

    pub fn set(&self, mb: u64) {
        self.mb.store(mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn used_memory_mb(&self) -> Option<u64> {
        Some(self.mb.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_probe_reads_own_process() {
        let probe = SysinfoProbe::new();
        assert!(probe.used_memory_mb().is_some());
    }

    #[test]
    fn test_fixed_probe() {
        let probe = FixedMemoryProbe::new(100);
        assert_eq!(probe.used_memory_mb(), Some(100));
        probe.set(4096);
        assert_eq!(probe.used_memory_mb(), Some(4096));
    }
}
