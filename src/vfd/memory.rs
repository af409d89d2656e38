// RAM-backed block driver. The default driver for tests and for building
// container images in memory before spilling them to a file.

use crate::common::Addr;
use crate::error::{ErrorKind, Result};
use crate::vfd::driver::{BlockDriver, DriverClass, DriverFeatures, OpenConfig};
use std::any::Any;
use std::cmp::Ordering;

#[derive(Debug)]
pub struct MemoryDriver {
    data: Vec<u8>,
    eoa: Addr,
    /// Distinguishes separate in-memory stores for `cmp`.
    instance: u64,
}

static NEXT_INSTANCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            eoa: 0,
            instance: NEXT_INSTANCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
        }
    }

    fn span(&self, addr: Addr, len: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(addr)
            .map_err(|_| ErrorKind::InvalidArgument(format!("address {addr:#x} out of range")))?;
        let end = start
            .checked_add(len)
            .ok_or_else(|| ErrorKind::InvalidArgument("length overflow".into()))?;
        Ok(start..end)
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDriver for MemoryDriver {
    fn query(&self) -> DriverFeatures {
        DriverFeatures::VECTOR_IO | DriverFeatures::TRUNCATE
    }

    fn get_eoa(&self) -> Addr {
        self.eoa
    }

    fn set_eoa(&mut self, eoa: Addr) -> Result<()> {
        self.eoa = eoa;
        Ok(())
    }

    fn get_eof(&self) -> Result<Addr> {
        Ok(self.data.len() as Addr)
    }

    fn read(&mut self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let span = self.span(addr, buf.len())?;
        if span.end > self.data.len() {
            return Err(ErrorKind::Io(format!(
                "read past end of store: {:#x}+{} > {}",
                addr,
                buf.len(),
                self.data.len()
            ))
            .into());
        }
        buf.copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        let span = self.span(addr, data.len())?;
        if span.end > self.data.len() {
            self.data.resize(span.end, 0);
        }
        self.data[span].copy_from_slice(data);
        Ok(())
    }

    fn read_vector(&mut self, batch: &mut [(Addr, &mut [u8])]) -> Result<()> {
        for (addr, buf) in batch.iter_mut() {
            let addr = *addr;
            self.read(addr, buf)?;
        }
        Ok(())
    }

    fn write_vector(&mut self, batch: &[(Addr, &[u8])]) -> Result<()> {
        for &(addr, data) in batch {
            self.write(addr, data)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        let eoa = usize::try_from(self.eoa)
            .map_err(|_| ErrorKind::InvalidArgument("eoa out of range".into()))?;
        self.data.truncate(eoa);
        if self.data.len() < eoa {
            self.data.resize(eoa, 0);
        }
        Ok(())
    }

    fn cmp(&self, other: &dyn BlockDriver) -> Option<Ordering> {
        other
            .as_any()
            .downcast_ref::<MemoryDriver>()
            .map(|o| self.instance.cmp(&o.instance))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Class for the RAM-backed driver; `open` always succeeds with a fresh
/// empty store.
#[derive(Debug)]
pub struct MemoryDriverClass;

impl DriverClass for MemoryDriverClass {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, _config: &OpenConfig) -> Result<Box<dyn BlockDriver>> {
        Ok(Box::new(MemoryDriver::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_round_trip() {
        let mut drv = MemoryDriver::new();
        drv.write(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        drv.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(drv.get_eof().unwrap(), 105);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut drv = MemoryDriver::new();
        drv.write(0, b"x").unwrap();
        let mut buf = [0u8; 8];
        assert!(drv.read(0, &mut buf).is_err());
    }

    #[test]
    fn test_truncate_to_eoa() {
        let mut drv = MemoryDriver::new();
        drv.write(0, &[1u8; 256]).unwrap();
        drv.set_eoa(64).unwrap();
        drv.truncate().unwrap();
        assert_eq!(drv.get_eof().unwrap(), 64);
    }

    #[test]
    fn test_cmp_distinguishes_instances() {
        let a = MemoryDriver::new();
        let b = MemoryDriver::new();
        assert_eq!(a.cmp(&a as &dyn BlockDriver), Some(Ordering::Equal));
        assert_ne!(a.cmp(&b as &dyn BlockDriver), Some(Ordering::Equal));
    }
}
