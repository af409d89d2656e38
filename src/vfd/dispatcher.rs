// Block-I/O dispatcher.
//
// Owns one open driver and exposes the full verb set to the cache. Missing
// driver capabilities (vector, selection I/O) are emulated by iteration, so
// callers never branch on driver features. Also maintains the class
// registry and hands out container serial numbers.

use crate::common::{addr_defined, Addr, ADDR_UNDEF};
use crate::error::{ErrorKind, Result, ResultExt};
use crate::vfd::driver::{BlockDriver, DriverClass, DriverFeatures, OpenConfig};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

// ============================================================================
// Driver class registry
// ============================================================================

static REGISTRY: Lazy<RwLock<Vec<Arc<dyn DriverClass>>>> = Lazy::new(|| RwLock::new(Vec::new()));

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Register a driver class. Re-registering a name replaces the old class.
pub fn register_driver(class: Arc<dyn DriverClass>) {
    let mut registry = REGISTRY.write();
    registry.retain(|c| c.name() != class.name());
    debug!(driver = class.name(), "registering block driver class");
    registry.push(class);
}

pub fn find_driver(name: &str) -> Option<Arc<dyn DriverClass>> {
    REGISTRY.read().iter().find(|c| c.name() == name).cloned()
}

/// Probe each registered class in registration order; first that accepts
/// the config wins.
pub fn try_open_any(config: &OpenConfig) -> Result<Option<BlockIo>> {
    let classes: Vec<_> = REGISTRY.read().iter().cloned().collect();
    for class in classes {
        if let Some(driver) = class.try_open(config)? {
            return Ok(Some(BlockIo::from_driver(driver)));
        }
    }
    Ok(None)
}

// ============================================================================
// Dispatcher
// ============================================================================

/// The dispatcher the metadata cache talks to. One per open container.
#[derive(Debug)]
pub struct BlockIo {
    driver: Box<dyn BlockDriver>,
    features: DriverFeatures,
    /// Monotonic serial number distinguishing open containers.
    serial: u64,
}

impl BlockIo {
    pub fn open(driver_name: &str, config: &OpenConfig) -> Result<Self> {
        let class = find_driver(driver_name)
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("no driver named {driver_name}")))?;
        let driver = class.open(config).ctx("opening block driver")?;
        Ok(Self::from_driver(driver))
    }

    pub fn from_driver(driver: Box<dyn BlockDriver>) -> Self {
        let features = driver.query();
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        debug!(serial, ?features, "block dispatcher open");
        Self {
            driver,
            features,
            serial,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn features(&self) -> DriverFeatures {
        self.features
    }

    pub fn driver(&self) -> &dyn BlockDriver {
        self.driver.as_ref()
    }

    // ------------------------------------------------------------------
    // Scalar verbs
    // ------------------------------------------------------------------

    pub fn get_eoa(&self) -> Addr {
        self.driver.get_eoa()
    }

    pub fn set_eoa(&mut self, eoa: Addr) -> Result<()> {
        self.driver.set_eoa(eoa)
    }

    pub fn get_eof(&self) -> Result<Addr> {
        self.driver.get_eof()
    }

    pub fn read(&mut self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        trace!(addr, len = buf.len(), "block read");
        self.driver.read(addr, buf)
    }

    pub fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        trace!(addr, len = data.len(), "block write");
        self.driver.write(addr, data)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.driver.flush()
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.driver.truncate()
    }

    pub fn lock(&mut self, exclusive: bool) -> Result<()> {
        self.driver.lock(exclusive)
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.driver.unlock()
    }

    pub fn ctl(&mut self, op: u32, input: Option<&dyn std::any::Any>) -> Result<()> {
        self.driver.ctl(op, input)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Bump-allocate `size` bytes at the end of allocation. Free-space
    /// managers sit above this and recycle interior space; the dispatcher
    /// only ever grows the tail.
    pub fn alloc(&mut self, size: u64) -> Result<Addr> {
        if size == 0 {
            return Err(ErrorKind::InvalidArgument("zero-length allocation".into()).into());
        }
        let addr = self.driver.get_eoa();
        let new_eoa = addr
            .checked_add(size)
            .ok_or_else(|| ErrorKind::Resource("address space exhausted".into()))?;
        self.driver.set_eoa(new_eoa)?;
        trace!(addr, size, new_eoa, "block alloc");
        Ok(addr)
    }

    /// Return space to the tail when possible. Interior frees are the
    /// free-space manager's job; here they are a no-op.
    pub fn free(&mut self, addr: Addr, size: u64) -> Result<()> {
        if !addr_defined(addr) || size == 0 {
            return Ok(());
        }
        let eoa = self.driver.get_eoa();
        if addr.saturating_add(size) == eoa {
            self.driver.set_eoa(addr)?;
            trace!(addr, size, "block free shrank eoa");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vector verbs
    // ------------------------------------------------------------------

    pub fn read_vector(&mut self, batch: &mut [(Addr, &mut [u8])]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.features.contains(DriverFeatures::VECTOR_IO) {
            return self.driver.read_vector(batch);
        }
        for (addr, buf) in batch.iter_mut() {
            self.driver.read(*addr, buf).ctx("emulated vector read")?;
        }
        Ok(())
    }

    pub fn write_vector(&mut self, batch: &[(Addr, &[u8])]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.features.contains(DriverFeatures::VECTOR_IO) {
            return self.driver.write_vector(batch);
        }
        for (addr, data) in batch {
            self.driver.write(*addr, data).ctx("emulated vector write")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Selection verbs
    // ------------------------------------------------------------------

    /// Gather the file `spans` into `buf`, packed in span order. `buf` must
    /// be exactly as long as the spans sum.
    pub fn read_selection(&mut self, spans: &[(Addr, usize)], buf: &mut [u8]) -> Result<()> {
        check_selection(spans, buf.len())?;
        if self.features.contains(DriverFeatures::SELECTION_IO) {
            return self.driver.read_selection(spans, buf);
        }
        let mut off = 0;
        for &(addr, len) in spans {
            self.driver
                .read(addr, &mut buf[off..off + len])
                .ctx("emulated selection read")?;
            off += len;
        }
        Ok(())
    }

    /// Scatter `buf` across the file `spans`, consumed in span order.
    pub fn write_selection(&mut self, spans: &[(Addr, usize)], buf: &[u8]) -> Result<()> {
        check_selection(spans, buf.len())?;
        if self.features.contains(DriverFeatures::SELECTION_IO) {
            return self.driver.write_selection(spans, buf);
        }
        let mut off = 0;
        for &(addr, len) in spans {
            self.driver
                .write(addr, &buf[off..off + len])
                .ctx("emulated selection write")?;
            off += len;
        }
        Ok(())
    }
}

fn check_selection(spans: &[(Addr, usize)], buf_len: usize) -> Result<()> {
    let total: usize = spans.iter().map(|&(_, len)| len).sum();
    if total != buf_len {
        return Err(ErrorKind::InvalidArgument(format!(
            "selection spans cover {total} bytes but buffer holds {buf_len}"
        ))
        .into());
    }
    if spans.iter().any(|&(addr, _)| addr == ADDR_UNDEF) {
        return Err(ErrorKind::InvalidArgument("selection span at undefined address".into()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfd::memory::MemoryDriverClass;

    fn mem_io() -> BlockIo {
        let class = MemoryDriverClass;
        BlockIo::from_driver(class.open(&OpenConfig::default()).unwrap())
    }

    #[test]
    fn test_serials_are_unique() {
        let a = mem_io();
        let b = mem_io();
        assert_ne!(a.serial(), b.serial());
    }

    #[test]
    fn test_alloc_bumps_eoa() {
        let mut io = mem_io();
        let a = io.alloc(128).unwrap();
        let b = io.alloc(64).unwrap();
        assert_eq!(b, a + 128);
        assert_eq!(io.get_eoa(), a + 192);
        // Tail free shrinks, interior free does not.
        io.free(b, 64).unwrap();
        assert_eq!(io.get_eoa(), a + 128);
        io.free(a, 1).unwrap();
        assert_eq!(io.get_eoa(), a + 128);
    }

    #[test]
    fn test_vector_emulation_round_trip() {
        let mut io = mem_io();
        io.alloc(1024).unwrap();
        io.write_vector(&[(0, b"alpha".as_ref()), (512, b"beta".as_ref())])
            .unwrap();

        let mut a = [0u8; 5];
        let mut b = [0u8; 4];
        {
            let mut batch: Vec<(Addr, &mut [u8])> = vec![(0, &mut a[..]), (512, &mut b[..])];
            io.read_vector(&mut batch).unwrap();
        }
        assert_eq!(&a, b"alpha");
        assert_eq!(&b, b"beta");
    }

    #[test]
    fn test_selection_emulation() {
        let mut io = mem_io();
        io.alloc(256).unwrap();
        io.write_selection(&[(0, 3), (100, 3)], b"abcdef").unwrap();
        let mut out = [0u8; 6];
        io.read_selection(&[(0, 3), (100, 3)], &mut out).unwrap();
        assert_eq!(&out, b"abcdef");

        let err = io.write_selection(&[(0, 4)], b"abc").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
    }
}
