//! CPU placement of dispatch workers
//!
//! A job may ask for a CPU class. Before processing it the worker moves
//! itself onto the CPU set and nice value configured for that class. The
//! current class is cached, so the syscalls only run when it changes.
//! Outside Linux the governor only tracks the class.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io;

use crate::config::CpuConfig;

/// Requested CPU class of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuClass {
    /// Scheduler default placement
    #[default]
    Default,
    /// Efficiency cores
    Little,
    /// Performance cores
    Big,
}

/// Applies [`CpuClass`] placement to the calling thread
#[derive(Debug)]
pub struct CpuGovernor {
    config: CpuConfig,
    current: Option<CpuClass>,
    switches: u64,
}

impl CpuGovernor {
    pub fn new(config: CpuConfig) -> Self {
        Self {
            config,
            current: None,
            switches: 0,
        }
    }

    /// Class the thread currently runs with
    pub fn current(&self) -> Option<CpuClass> {
        self.current
    }

    /// Times the placement actually changed
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Moves the calling thread to `class`.
    ///
    /// Returns `Ok(false)` when nothing had to change.
    pub fn apply(&mut self, class: CpuClass) -> io::Result<bool> {
        if !self.config.enabled || self.current == Some(class) {
            return Ok(false);
        }

        let (cpus, nice) = match class {
            CpuClass::Default => (self.default_cpus(), self.config.default_nice),
            CpuClass::Little => (self.config.little_cpus.clone(), self.config.little_nice),
            CpuClass::Big => (self.config.big_cpus.clone(), self.config.big_nice),
        };

        // Cache first: a failing syscall is not retried every frame
        self.current = Some(class);
        self.switches += 1;

        if !cpus.is_empty() {
            set_affinity(&cpus)?;
        }
        set_nice(nice)?;
        debug!("🧵 worker moved to {:?} cpus {:?} nice {}", class, cpus, nice);
        Ok(true)
    }

    /// Like [`apply`](Self::apply) but only logs failures
    pub fn apply_or_warn(&mut self, class: CpuClass) {
        if let Err(e) = self.apply(class) {
            warn!("⚠️ failed to apply {:?} cpu placement: {}", class, e);
        }
    }

    fn default_cpus(&self) -> Vec<usize> {
        let mut cpus: Vec<usize> = self
            .config
            .little_cpus
            .iter()
            .chain(&self.config.big_cpus)
            .copied()
            .collect();
        cpus.sort_unstable();
        cpus.dedup();
        cpus
    }
}

#[cfg(target_os = "linux")]
fn set_affinity(cpus: &[usize]) -> io::Result<()> {
    let limit = libc::CPU_SETSIZE as usize;
    // SAFETY: cpu_set_t is plain data; zeroed is the empty set
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for &cpu in cpus.iter().filter(|&&cpu| cpu < limit) {
        // SAFETY: cpu is below CPU_SETSIZE
        unsafe { libc::CPU_SET(cpu, &mut set) };
    }
    // SAFETY: set outlives the call; pid 0 is the calling thread
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_nice(nice: i32) -> io::Result<()> {
    // SAFETY: gettid has no arguments and cannot fail
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as libc::id_t;
    // SAFETY: plain syscall on our own thread id
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid, nice) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_cpus: &[usize]) -> io::Result<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_nice(_nice: i32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_disabled_governor_does_nothing() {
        let mut governor = CpuGovernor::new(CpuConfig::default());
        assert!(!governor.apply(CpuClass::Big).unwrap());
        assert_eq!(governor.current(), None);
    }

    #[test]
    #[serial]
    fn test_class_is_cached() {
        let config = CpuConfig {
            enabled: true,
            little_cpus: Vec::new(),
            big_cpus: Vec::new(),
            default_nice: 0,
            little_nice: 0,
            big_nice: 0,
        };

        // Runs on its own thread so the nice value does not leak into other tests
        std::thread::spawn(move || {
            let mut governor = CpuGovernor::new(config);
            assert!(governor.apply(CpuClass::Little).unwrap());
            assert!(!governor.apply(CpuClass::Little).unwrap());
            assert!(governor.apply(CpuClass::Default).unwrap());
            assert_eq!(governor.switches(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_cpu_class_serde_names() {
        let class: CpuClass = serde_json::from_str("\"big\"").unwrap();
        assert_eq!(class, CpuClass::Big);
        assert_eq!(serde_json::to_string(&CpuClass::Little).unwrap(), "\"little\"");
    }
}
