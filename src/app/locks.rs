use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Advisory per-device locks. Two runs targeting the same device serialize on
/// the lock instead of racing the device; distinct devices proceed in
/// parallel. The registry only grows — device keys are few and long-lived.
#[derive(Default)]
pub struct DeviceLockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeviceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().expect("device locks poisoned");
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
