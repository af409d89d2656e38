// Plain-file block driver built on std::fs. One container per file,
// positioned reads and writes, advisory whole-file locking.

use crate::common::Addr;
use crate::error::{CofferError, ErrorKind, Result, ResultExt};
use crate::vfd::driver::{BlockDriver, DriverClass, DriverFeatures, OpenConfig};
use std::any::Any;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

#[derive(Debug)]
pub struct FileDriver {
    file: File,
    path: PathBuf,
    canonical: PathBuf,
    eoa: Addr,
    read_only: bool,
    locked: bool,
}

impl FileDriver {
    pub fn open(config: &OpenConfig) -> Result<Self> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| ErrorKind::InvalidArgument("file driver requires a path".into()))?;

        let file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(config.create && !config.read_only)
            .open(&path)
            .map_err(CofferError::from)
            .ctx(format!("opening {}", path.display()))?;

        let eof = file.metadata().map_err(|e| ErrorKind::Io(e.to_string()))?.len();
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());

        Ok(Self {
            file,
            path,
            canonical,
            eoa: eof,
            read_only: config.read_only,
            locked: false,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(ErrorKind::ReadOnly.into())
        } else {
            Ok(())
        }
    }
}

impl BlockDriver for FileDriver {
    fn query(&self) -> DriverFeatures {
        DriverFeatures::PERSISTENT | DriverFeatures::LOCKING | DriverFeatures::TRUNCATE
    }

    fn get_eoa(&self) -> Addr {
        self.eoa
    }

    fn set_eoa(&mut self, eoa: Addr) -> Result<()> {
        self.eoa = eoa;
        Ok(())
    }

    fn get_eof(&self) -> Result<Addr> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| ErrorKind::Io(e.to_string()))?
            .len())
    }

    fn read(&mut self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(addr))
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        self.file
            .read_exact(buf)
            .map_err(|e| ErrorKind::Io(format!("short read at {addr:#x}: {e}")))?;
        Ok(())
    }

    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.file
            .seek(SeekFrom::Start(addr))
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        self.file
            .write_all(data)
            .map_err(|e| ErrorKind::Io(format!("short write at {addr:#x}: {e}")))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file
            .sync_all()
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.check_writable()?;
        self.file
            .set_len(self.eoa)
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        Ok(())
    }

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        let res = if exclusive {
            self.file.lock()
        } else {
            self.file.lock_shared()
        };
        res.map_err(|e| ErrorKind::Io(format!("lock failed: {e}")))?;
        self.locked = true;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        if self.locked {
            self.file
                .unlock()
                .map_err(|e| ErrorKind::Io(format!("unlock failed: {e}")))?;
            self.locked = false;
        }
        Ok(())
    }

    fn cmp(&self, other: &dyn BlockDriver) -> Option<Ordering> {
        other
            .as_any()
            .downcast_ref::<FileDriver>()
            .map(|o| self.canonical.cmp(&o.canonical))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct FileDriverClass;

impl DriverClass for FileDriverClass {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self, config: &OpenConfig) -> Result<Box<dyn BlockDriver>> {
        Ok(Box::new(FileDriver::open(config)?))
    }

    fn try_open(&self, config: &OpenConfig) -> Result<Option<Box<dyn BlockDriver>>> {
        if config.path.is_none() {
            return Ok(None);
        }
        match FileDriver::open(config) {
            Ok(driver) => Ok(Some(Box::new(driver))),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.cf");
        let mut drv = FileDriver::open(&OpenConfig::path(&path)).unwrap();
        drv.write(0x100, b"payload").unwrap();
        drv.flush().unwrap();

        let mut buf = [0u8; 7];
        drv.read(0x100, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
        assert_eq!(drv.get_eof().unwrap(), 0x107);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.cf");
        {
            let mut drv = FileDriver::open(&OpenConfig::path(&path)).unwrap();
            drv.write(0, b"x").unwrap();
        }
        let mut ro = FileDriver::open(&OpenConfig::path(&path).read_only()).unwrap();
        let err = ro.write(0, b"y").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ReadOnly));
    }

    #[test]
    fn test_truncate_to_eoa() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.cf");
        let mut drv = FileDriver::open(&OpenConfig::path(&path)).unwrap();
        drv.write(0, &[7u8; 512]).unwrap();
        drv.set_eoa(100).unwrap();
        drv.truncate().unwrap();
        assert_eq!(drv.get_eof().unwrap(), 100);
    }

    #[test]
    fn test_cmp_same_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.cf");
        let a = FileDriver::open(&OpenConfig::path(&path)).unwrap();
        let b = FileDriver::open(&OpenConfig::path(&path)).unwrap();
        assert_eq!(a.cmp(&b as &dyn BlockDriver), Some(Ordering::Equal));
    }

    #[test]
    fn test_try_open_probe() {
        let class = FileDriverClass;
        assert!(class.try_open(&OpenConfig::default()).unwrap().is_none());
        let dir = tempdir().unwrap();
        let cfg = OpenConfig::path(dir.path().join("probe.cf"));
        assert!(class.try_open(&cfg).unwrap().is_some());
    }
}
