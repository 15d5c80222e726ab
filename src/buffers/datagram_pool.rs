use crate::datagram::Datagram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, trace};

/// A pool of datagrams for reuse, shared between all tasks of an endpoint. Rented datagrams
///  that are never returned are simply dropped, which is not an error.
pub struct DatagramPool {
    max_pool_size: usize,
    datagrams: Mutex<Vec<Datagram>>,
    num_created: AtomicU64,
    num_reused: AtomicU64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolStats {
    /// number of datagrams allocated because the pool was empty
    pub created: u64,
    /// number of datagrams that were handed out from the pool
    pub reused: u64,
    /// number of datagrams currently in the pool
    pub pooled: usize,
}

impl DatagramPool {
    pub fn new(max_pool_size: usize) -> Self {
        DatagramPool {
            max_pool_size,
            datagrams: Mutex::new(Vec::with_capacity(max_pool_size)),
            num_created: AtomicU64::new(0),
            num_reused: AtomicU64::new(0),
        }
    }

    /// Returns an empty, zero-initialized datagram
    pub fn rent(&self) -> Datagram {
        {
            let mut datagrams = self.datagrams.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(datagram) = datagrams.pop() {
                trace!("returning datagram from pool");
                self.num_reused.fetch_add(1, Ordering::Relaxed);
                return datagram;
            }
        }

        debug!("no datagram in pool: creating new datagram");
        self.num_created.fetch_add(1, Ordering::Relaxed);
        Datagram::new()
    }

    pub fn return_to_pool(&self, mut datagram: Datagram) {
        datagram.clear();

        let mut datagrams = self.datagrams.lock().unwrap_or_else(PoisonError::into_inner);
        if datagrams.len() < self.max_pool_size {
            trace!("returning datagram to pool");
            datagrams.push(datagram);
        }
        else {
            debug!("pool is full: discarding returned datagram");
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.num_created.load(Ordering::Relaxed),
            reused: self.num_reused.load(Ordering::Relaxed),
            pooled: self.datagrams.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}
