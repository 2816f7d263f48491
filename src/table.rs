//! Process-wide table of monitored connections.

use std::sync::{Arc, Mutex, RwLock};

use slab::Slab;
use slog::Logger;

use connection::ConnState;

/// Key identifying one monitored socket: the owning process and the
/// socket handle within it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnKey {
    pub pid: u32,
    pub fd: u32,
}

impl ConnKey {
    pub fn new(pid: u32, fd: u32) -> Self {
        ConnKey { pid, fd }
    }

    /// Bucket selector. Only ever a hash input; key equality always
    /// compares both components.
    pub fn hash(&self) -> u32 {
        self.pid ^ self.fd
    }
}

/// Stable handle of a record within the table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

#[derive(Debug, Fail)]
pub enum InsertError {
    /// The table already holds a record for this key.
    #[fail(display = "record already exists for pid {} fd {}", pid, fd)]
    Duplicate { pid: u32, fd: u32 },
}

/// Hash-indexed map from `(pid, fd)` to connection records.
///
/// Buckets are selected by the XOR of the key components over a fixed
/// power-of-two bucket array with open chaining. Readers proceed
/// concurrently; insertion and removal take the write lock. Records are
/// handed out behind `Arc<Mutex<_>>` so no table lock is ever held while
/// a record is being driven.
pub struct ConnTable {
    log: Logger,
    inner: RwLock<Inner>,
}

struct Inner {
    buckets: Box<[Vec<(ConnKey, ConnectionHandle)>]>,
    records: Slab<Arc<Mutex<ConnState>>>,
    allocs: u64,
    frees: u64,
}

impl Inner {
    fn bucket(&self, key: &ConnKey) -> usize {
        key.hash() as usize & (self.buckets.len() - 1)
    }
}

impl ConnTable {
    pub fn new(log: Logger, buckets: usize) -> Self {
        assert!(buckets.is_power_of_two());
        ConnTable {
            log,
            inner: RwLock::new(Inner {
                buckets: vec![Vec::new(); buckets].into_boxed_slice(),
                records: Slab::new(),
                allocs: 0,
                frees: 0,
            }),
        }
    }

    /// Register a fresh record. At most one record may exist per key;
    /// inserting a duplicate is a caller error and is rejected.
    pub fn insert(&self, conn: ConnState) -> Result<ConnectionHandle, InsertError> {
        let mut inner = self.inner.write().unwrap();
        let key = conn.key;
        let bucket = inner.bucket(&key);
        if inner.buckets[bucket].iter().any(|&(k, _)| k == key) {
            return Err(InsertError::Duplicate {
                pid: key.pid,
                fd: key.fd,
            });
        }
        let handle = ConnectionHandle(inner.records.insert(Arc::new(Mutex::new(conn))));
        inner.buckets[bucket].push((key, handle));
        inner.allocs += 1;
        trace!(self.log, "record inserted"; "pid" => key.pid, "fd" => key.fd,
               "bucket" => bucket);
        Ok(handle)
    }

    pub fn get(&self, pid: u32, fd: u32) -> Option<Arc<Mutex<ConnState>>> {
        let inner = self.inner.read().unwrap();
        let key = ConnKey::new(pid, fd);
        let bucket = inner.bucket(&key);
        inner.buckets[bucket]
            .iter()
            .find(|&&(k, _)| k == key)
            .map(|&(_, handle)| inner.records[handle.0].clone())
    }

    /// Remove and drop the record for `(pid, fd)`. Returns whether a
    /// record was present.
    pub fn remove(&self, pid: u32, fd: u32) -> bool {
        let mut inner = self.inner.write().unwrap();
        let key = ConnKey::new(pid, fd);
        let bucket = inner.bucket(&key);
        let at = match inner.buckets[bucket].iter().position(|&(k, _)| k == key) {
            Some(at) => at,
            None => return false,
        };
        let (_, handle) = inner.buckets[bucket].remove(at);
        inner.records.remove(handle.0);
        inner.frees += 1;
        trace!(self.log, "record removed"; "pid" => key.pid, "fd" => key.fd);
        true
    }

    /// Drain the table on shutdown, dropping every record. Returns the
    /// number of records dropped.
    pub fn free_all(&self) -> usize {
        let mut inner = self.inner.write().unwrap();
        for bucket in inner.buckets.iter_mut() {
            bucket.clear();
        }
        let dropped = inner.records.len();
        inner.records.clear();
        inner.frees += dropped as u64;
        info!(self.log, "connection table drained"; "records" => dropped,
              "allocs_minus_frees" => inner.allocs - inner.frees);
        dropped
    }

    /// Allocation count minus free count, for leak assertions.
    pub fn outstanding(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.allocs - inner.frees
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tests::{conn_state, logger};

    fn table() -> ConnTable {
        ConnTable::new(logger(), 16)
    }

    #[test]
    fn insert_then_get() {
        let table = table();
        table.insert(conn_state(10, 3)).unwrap();
        assert!(table.get(10, 3).is_some());
        assert!(table.get(10, 4).is_none());
        assert!(table.get(11, 3).is_none());
    }

    #[test]
    fn duplicate_key_rejected() {
        let table = table();
        table.insert(conn_state(10, 3)).unwrap();
        assert_matches!(
            table.insert(conn_state(10, 3)),
            Err(InsertError::Duplicate { pid: 10, fd: 3 })
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn colliding_keys_coexist() {
        // 1 ^ 2 == 2 ^ 1: same bucket, distinct keys.
        let table = table();
        table.insert(conn_state(1, 2)).unwrap();
        table.insert(conn_state(2, 1)).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.remove(1, 2));
        assert!(table.get(2, 1).is_some());
        assert!(table.get(1, 2).is_none());
    }

    #[test]
    fn remove_reports_presence() {
        let table = table();
        table.insert(conn_state(7, 7)).unwrap();
        assert!(table.remove(7, 7));
        assert!(!table.remove(7, 7));
    }

    #[test]
    fn allocation_balance_after_free_all() {
        let table = table();
        for fd in 0..32 {
            table.insert(conn_state(99, fd)).unwrap();
        }
        table.remove(99, 5);
        assert_eq!(table.outstanding(), 31);
        assert_eq!(table.free_all(), 31);
        assert_eq!(table.outstanding(), 0);
        assert!(table.is_empty());
    }
}
