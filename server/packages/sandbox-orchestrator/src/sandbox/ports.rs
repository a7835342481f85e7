use std::io;
use std::net::TcpListener;

use tokio::sync::{Mutex, MutexGuard};

/// Hands out free host ports. Allocation is serialized so two concurrent
/// sandbox starts in this process never receive the same port; the guard is
/// held until the container has bound it.
#[derive(Debug, Default)]
pub struct PortAllocator {
    lock: Mutex<()>,
}

#[derive(Debug)]
pub struct PortReservation<'a> {
    pub ports: Vec<u16>,
    _guard: MutexGuard<'a, ()>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reserve(&self, count: usize) -> io::Result<PortReservation<'_>> {
        let guard = self.lock.lock().await;
        // Keep every listener open until all ports are read so one call never
        // gets duplicates.
        let listeners = (0..count)
            .map(|_| TcpListener::bind("0.0.0.0:0"))
            .collect::<io::Result<Vec<_>>>()?;
        let ports = listeners
            .iter()
            .map(|listener| listener.local_addr().map(|addr| addr.port()))
            .collect::<io::Result<Vec<_>>>()?;
        drop(listeners);
        Ok(PortReservation {
            ports,
            _guard: guard,
        })
    }
}
