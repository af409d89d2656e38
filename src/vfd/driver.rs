// Block-I/O driver classes.
//
// A driver class describes how to open one kind of backing store; an open
// driver instance services the verb set the dispatcher exposes to the cache.
// Drivers advertise optional verbs (vector, selection I/O) through feature
// bits; the dispatcher emulates anything not advertised.

use crate::common::Addr;
use crate::error::{ErrorKind, Result};
use std::any::Any;
use std::cmp::Ordering;
use std::fmt::Debug;
use std::path::PathBuf;

bitflags::bitflags! {
    /// Capabilities reported by `BlockDriver::query`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverFeatures: u32 {
        /// Native vectored read/write.
        const VECTOR_IO      = 1 << 0;
        /// Native selection (scatter/gather) read/write.
        const SELECTION_IO   = 1 << 1;
        /// Backing store survives close (memory drivers clear this).
        const PERSISTENT     = 1 << 2;
        /// `lock`/`unlock` do real inter-process locking.
        const LOCKING        = 1 << 3;
        /// `truncate` reclaims backing space.
        const TRUNCATE       = 1 << 4;
    }
}

/// How a driver should open its backing store.
#[derive(Debug, Clone, Default)]
pub struct OpenConfig {
    pub path: Option<PathBuf>,
    pub read_only: bool,
    pub create: bool,
}

impl OpenConfig {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            read_only: false,
            create: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self.create = false;
        self
    }
}

/// An open backing store. All offsets are absolute container addresses.
///
/// Only `read`, `write`, `flush`, `truncate` and `lock` may block; everything
/// else is bookkeeping.
pub trait BlockDriver: Debug + Send {
    fn query(&self) -> DriverFeatures;

    /// Current end-of-allocation marker.
    fn get_eoa(&self) -> Addr;

    fn set_eoa(&mut self, eoa: Addr) -> Result<()>;

    /// End of the backing store's real data.
    fn get_eof(&self) -> Result<Addr>;

    fn read(&mut self, addr: Addr, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()>;

    /// Native vectored read. Only called when VECTOR_IO is advertised.
    fn read_vector(&mut self, batch: &mut [(Addr, &mut [u8])]) -> Result<()> {
        let _ = batch;
        Err(ErrorKind::NotSupported("read_vector").into())
    }

    /// Native vectored write. Only called when VECTOR_IO is advertised.
    fn write_vector(&mut self, batch: &[(Addr, &[u8])]) -> Result<()> {
        let _ = batch;
        Err(ErrorKind::NotSupported("write_vector").into())
    }

    /// Native selection read: gather `spans` (addr, len) into `buf` in order.
    fn read_selection(&mut self, spans: &[(Addr, usize)], buf: &mut [u8]) -> Result<()> {
        let _ = (spans, buf);
        Err(ErrorKind::NotSupported("read_selection").into())
    }

    /// Native selection write: scatter `buf` across `spans` in order.
    fn write_selection(&mut self, spans: &[(Addr, usize)], buf: &[u8]) -> Result<()> {
        let _ = (spans, buf);
        Err(ErrorKind::NotSupported("write_selection").into())
    }

    fn flush(&mut self) -> Result<()>;

    /// Shrink or grow the backing store to the current EOA.
    fn truncate(&mut self) -> Result<()>;

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        let _ = exclusive;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    /// Driver-specific control verb.
    fn ctl(&mut self, op: u32, input: Option<&dyn Any>) -> Result<()> {
        let _ = (op, input);
        Err(ErrorKind::NotSupported("ctl").into())
    }

    /// Compare backing stores; `Equal` means both name the same store.
    /// `None` when `other` is a different driver kind.
    fn cmp(&self, other: &dyn BlockDriver) -> Option<Ordering>;

    fn as_any(&self) -> &dyn Any;
}

/// A registered driver kind.
pub trait DriverClass: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, config: &OpenConfig) -> Result<Box<dyn BlockDriver>>;

    /// Probe whether this class can open `config` without treating failure
    /// as an error.
    fn try_open(&self, config: &OpenConfig) -> Result<Option<Box<dyn BlockDriver>>> {
        match self.open(config) {
            Ok(driver) => Ok(Some(driver)),
            Err(_) => Ok(None),
        }
    }
}
