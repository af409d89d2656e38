// Persisted cache image.
//
// An optional on-disk snapshot of the cache: entry descriptors plus their
// serialized images, written at close and decoded wholesale on the first
// protect after reopen. Restoring the working set this way skips the
// one-miss-per-entry warmup a cold cache pays.
//
// Layout: header (magic, version, flags, entry count), one descriptor per
// entry (address, size, class id, tag, ring, dependency parents), the
// concatenated payload blob, crc32c trailer over everything before it.

use crate::cache::class::ClassFlags;
use crate::cache::engine::MetadataCache;
use crate::cache::entry::CacheEntry;
use crate::common::{Addr, Ring, Tag};
use crate::error::{ErrorKind, Result, ResultExt};
use tracing::debug;

const IMAGE_MAGIC: &[u8; 4] = b"CFIM";
const IMAGE_VERSION: u8 = 1;

struct Descriptor {
    addr: Addr,
    size: usize,
    class: u16,
    tag: Tag,
    ring: Ring,
    parents: Vec<Addr>,
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(ErrorKind::Corruption("cache image truncated".into()).into());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

impl MetadataCache {
    /// Where the cache image lives and how long it is. The length is
    /// updated by `store_image`; callers persist both for the reopen.
    pub fn image_location(&self) -> (Addr, usize) {
        (self.config.image_addr, self.config.image_len)
    }

    /// Serialize the resident entry set into the configured image block.
    /// Entries without an on-disk form (ghosts, imageless classes) are
    /// left out; they rebuild themselves on demand.
    pub(crate) fn store_image(&mut self) -> Result<()> {
        let mut descriptors = Vec::new();
        let mut blob = Vec::new();

        let addrs: Vec<Addr> = self.index.addrs().collect();
        for addr in addrs {
            let entry = self.index.get(addr).expect("index out of sync");
            let class = std::sync::Arc::clone(self.registry.get(entry.class)?);
            if entry.ghost || class.flags().contains(ClassFlags::NO_IMAGE) {
                continue;
            }
            let cell = entry.payload.clone();
            let len = class.image_len(&**cell.read());
            let mut image = vec![0u8; len];
            class
                .serialize(&**cell.read(), &mut image)
                .ctx("serializing entry for image")?;
            let entry = self.index.get(addr).expect("index out of sync");
            descriptors.push(Descriptor {
                addr,
                size: len,
                class: entry.class.0,
                tag: entry.tag,
                ring: entry.ring,
                parents: entry.dep_parents.iter().copied().collect(),
            });
            blob.extend_from_slice(&image);
        }

        let mut out = Vec::with_capacity(64 + blob.len());
        out.extend_from_slice(IMAGE_MAGIC);
        out.push(IMAGE_VERSION);
        out.push(0); // flags
        put_u32(&mut out, descriptors.len() as u32);
        for d in &descriptors {
            put_u64(&mut out, d.addr);
            put_u64(&mut out, d.size as u64);
            put_u16(&mut out, d.class);
            put_u64(&mut out, d.tag.0);
            out.push(d.ring as u8);
            put_u16(&mut out, d.parents.len() as u16);
            for p in &d.parents {
                put_u64(&mut out, *p);
            }
        }
        out.extend_from_slice(&blob);
        let checksum = crc32c::crc32c(&out);
        put_u32(&mut out, checksum);

        self.config.image_len = out.len();
        self.io
            .write(self.config.image_addr, &out)
            .ctx("writing cache image block")?;
        debug!(
            entries = descriptors.len(),
            bytes = out.len(),
            addr = self.config.image_addr,
            "cache image stored"
        );
        Ok(())
    }

    /// Decode the configured image block and insert every entry it holds,
    /// clean, with dependency edges restored.
    pub(crate) fn load_image(&mut self) -> Result<()> {
        // Set first: the inserts below must not re-enter this path.
        self.image_loaded = true;
        if self.config.image_len == 0 {
            return Err(ErrorKind::InvalidArgument(
                "image address configured without an image length".into(),
            )
            .into());
        }
        let mut raw = vec![0u8; self.config.image_len];
        self.io
            .read(self.config.image_addr, &mut raw)
            .ctx("reading cache image block")?;

        if raw.len() < 4 {
            return Err(ErrorKind::Corruption("cache image too short".into()).into());
        }
        let (body, trailer) = raw.split_at(raw.len() - 4);
        let stored = u32::from_le_bytes(trailer.try_into().unwrap());
        if crc32c::crc32c(body) != stored {
            return Err(ErrorKind::Corruption("cache image checksum mismatch".into()).into());
        }

        let mut r = Reader::new(body);
        if r.take(4)? != IMAGE_MAGIC {
            return Err(ErrorKind::Corruption("bad cache image magic".into()).into());
        }
        let version = r.u8()?;
        if version != IMAGE_VERSION {
            return Err(ErrorKind::Corruption(format!(
                "unsupported cache image version {version}"
            ))
            .into());
        }
        let _flags = r.u8()?;
        let count = r.u32()? as usize;

        let mut descriptors = Vec::with_capacity(count);
        for _ in 0..count {
            let addr = r.u64()?;
            let size = r.u64()? as usize;
            let class = r.u16()?;
            let tag = Tag(r.u64()?);
            let ring = Ring::from_index(r.u8()? as usize)
                .ok_or_else(|| ErrorKind::Corruption("bad ring in cache image".into()))?;
            let parent_count = r.u16()? as usize;
            let mut parents = Vec::with_capacity(parent_count);
            for _ in 0..parent_count {
                parents.push(r.u64()?);
            }
            descriptors.push(Descriptor {
                addr,
                size,
                class,
                tag,
                ring,
                parents,
            });
        }

        for d in &descriptors {
            let class = std::sync::Arc::clone(
                self.registry.get(crate::cache::class::ClassId(d.class))?,
            );
            let image = r.take(d.size)?;
            let payload = class
                .deserialize(image, &())
                .ctx("decoding image entry payload")?;
            if self.index.contains(d.addr) {
                return Err(ErrorKind::AlreadyExists(d.addr).into());
            }
            let entry = CacheEntry::new(
                d.addr,
                d.size,
                crate::cache::class::ClassId(d.class),
                d.tag,
                d.ring,
                payload,
                false,
            );
            self.index.insert(entry);
            self.tags.register(d.tag, d.addr);
        }
        for d in &descriptors {
            for parent in &d.parents {
                if self.index.contains(*parent) {
                    self.create_flush_dependency(*parent, d.addr)
                        .ctx("restoring image dependency")?;
                }
            }
        }
        debug!(entries = descriptors.len(), "cache image decoded");
        Ok(())
    }
}
