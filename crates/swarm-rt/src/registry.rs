//! Named process registration and lookup.
//!
//! Processes can register under a string name and be found by other
//! processes or external threads. One name per process, one process per
//! name; the registration disappears when the owner exits.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::REG_NAME_MAX;
use crate::process::ProcessRef;

/// Why a registry operation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Name is empty or longer than `REG_NAME_MAX - 1` bytes.
    BadName,
    /// The name already maps to a live process.
    NameTaken,
    /// The process is already registered under another name.
    AlreadyRegistered,
    /// The target process is not alive.
    NoProcess,
    /// The name is not registered.
    NotFound,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::BadName => write!(f, "invalid registry name"),
            RegistryError::NameTaken => write!(f, "name already registered"),
            RegistryError::AlreadyRegistered => write!(f, "process already has a name"),
            RegistryError::NoProcess => write!(f, "no such process"),
            RegistryError::NotFound => write!(f, "name not registered"),
        }
    }
}

/// The global name table. Reads are concurrent; writes are exclusive.
pub struct Registry {
    /// name -> process
    names: RwLock<FxHashMap<String, ProcessRef>>,
    /// pid -> name reverse index, for exit cleanup and the one-name rule.
    by_pid: RwLock<FxHashMap<u64, String>>,
}

impl Registry {
    pub fn with_capacity(buckets: usize) -> Registry {
        let mut names = FxHashMap::default();
        names.reserve(buckets);
        Registry {
            names: RwLock::new(names),
            by_pid: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register `target` under `name`.
    pub fn register(&self, name: &str, target: ProcessRef) -> Result<(), RegistryError> {
        if name.is_empty() || name.len() >= REG_NAME_MAX {
            return Err(RegistryError::BadName);
        }

        let mut names = self.names.write();
        let mut by_pid = self.by_pid.write();

        if names.contains_key(name) {
            return Err(RegistryError::NameTaken);
        }
        if by_pid.contains_key(&target.pid.as_u64()) {
            return Err(RegistryError::AlreadyRegistered);
        }

        names.insert(name.to_string(), target);
        by_pid.insert(target.pid.as_u64(), name.to_string());
        Ok(())
    }

    /// Remove a registration by name.
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let mut names = self.names.write();
        let Some(target) = names.remove(name) else {
            return Err(RegistryError::NotFound);
        };
        self.by_pid.write().remove(&target.pid.as_u64());
        Ok(())
    }

    /// Look a process up by name.
    pub fn whereis(&self, name: &str) -> Option<ProcessRef> {
        self.names.read().get(name).copied()
    }

    /// Drop the registration held by `pid`, if any. Called during exit
    /// propagation.
    pub fn cleanup(&self, pid: u64) {
        let Some(name) = self.by_pid.write().remove(&pid) else {
            return;
        };
        self.names.write().remove(&name);
    }

    /// Number of live registrations (diagnostics).
    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Pid;

    fn pref(slot: u32, pid: u64) -> ProcessRef {
        ProcessRef {
            slot,
            pid: Pid(pid),
        }
    }

    #[test]
    fn test_register_and_whereis() {
        let reg = Registry::with_capacity(16);
        let p = pref(0, 10);

        reg.register("counter", p).unwrap();
        assert_eq!(reg.whereis("counter"), Some(p));
        assert_eq!(reg.whereis("missing"), None);
    }

    #[test]
    fn test_register_roundtrip_law() {
        let reg = Registry::with_capacity(16);
        let p = pref(1, 11);

        reg.register("svc", p).unwrap();
        assert_eq!(reg.whereis("svc"), Some(p));
        reg.unregister("svc").unwrap();
        assert_eq!(reg.whereis("svc"), None);
    }

    #[test]
    fn test_duplicate_name_fails() {
        let reg = Registry::with_capacity(16);
        reg.register("svc", pref(0, 1)).unwrap();
        assert_eq!(
            reg.register("svc", pref(1, 2)),
            Err(RegistryError::NameTaken)
        );
    }

    #[test]
    fn test_one_name_per_process() {
        let reg = Registry::with_capacity(16);
        let p = pref(0, 1);
        reg.register("first", p).unwrap();
        assert_eq!(
            reg.register("second", p),
            Err(RegistryError::AlreadyRegistered)
        );
    }

    #[test]
    fn test_name_length_bound() {
        let reg = Registry::with_capacity(16);
        assert_eq!(reg.register("", pref(0, 1)), Err(RegistryError::BadName));

        let too_long = "x".repeat(REG_NAME_MAX);
        assert_eq!(
            reg.register(&too_long, pref(0, 1)),
            Err(RegistryError::BadName)
        );

        let just_fits = "x".repeat(REG_NAME_MAX - 1);
        reg.register(&just_fits, pref(0, 1)).unwrap();
    }

    #[test]
    fn test_unregister_unknown() {
        let reg = Registry::with_capacity(16);
        assert_eq!(reg.unregister("ghost"), Err(RegistryError::NotFound));
    }

    #[test]
    fn test_cleanup_removes_name() {
        let reg = Registry::with_capacity(16);
        reg.register("svc", pref(3, 30)).unwrap();
        reg.cleanup(30);
        assert_eq!(reg.whereis("svc"), None);
        assert!(reg.is_empty());

        // Cleanup of an unregistered pid is a no-op.
        reg.cleanup(31);
    }

    #[test]
    fn test_name_free_after_cleanup() {
        let reg = Registry::with_capacity(16);
        reg.register("svc", pref(0, 1)).unwrap();
        reg.cleanup(1);
        reg.register("svc", pref(1, 2)).unwrap();
        assert_eq!(reg.whereis("svc"), Some(pref(1, 2)));
    }

    #[test]
    fn test_concurrent_register_whereis() {
        use std::sync::Arc;

        let reg = Arc::new(Registry::with_capacity(16));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    let p = pref(t as u32, 100 + t);
                    let name = format!("worker_{}", t);
                    reg.register(&name, p).unwrap();
                    assert_eq!(reg.whereis(&name), Some(p));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 8);
    }
}
