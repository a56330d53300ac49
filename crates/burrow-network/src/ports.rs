//! Host port pool for inbound mappings.

use crate::NetworkError;
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct PortPool {
    start: u32,
    size: u32,
    free: Mutex<VecDeque<u32>>,
}

impl PortPool {
    pub fn new(start: u32, size: u32) -> Self {
        Self {
            start,
            size,
            free: Mutex::new((start..start + size).collect()),
        }
    }

    pub fn acquire(&self) -> Result<u32, NetworkError> {
        self.free
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(NetworkError::PortPoolExhausted)
    }

    /// Return a port. Ports outside the pool's range and double
    /// releases are ignored.
    pub fn release(&self, port: u32) {
        if port < self.start || port >= self.start + self.size {
            return;
        }
        let mut free = self.free.lock().unwrap();
        if !free.contains(&port) {
            free.push_back(port);
        }
    }

    /// Claim a restored port so it is never handed out.
    pub fn remove(&self, port: u32) -> Result<(), NetworkError> {
        let mut free = self.free.lock().unwrap();
        match free.iter().position(|p| *p == port) {
            Some(index) => {
                free.remove(index);
                Ok(())
            }
            None => Err(NetworkError::PortAlreadyAcquired(port)),
        }
    }
}
