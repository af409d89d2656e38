// # Virtual Block I/O
//
// The seam between the metadata cache and whatever actually holds the
// container bytes. Driver classes register with the dispatcher; the cache
// talks only to `BlockIo`, which fills in vectored and selection variants
// for drivers that lack them.

pub mod dispatcher;
pub mod driver;
pub mod file;
pub mod memory;

pub use dispatcher::{find_driver, register_driver, try_open_any, BlockIo};
pub use driver::{BlockDriver, DriverClass, DriverFeatures, OpenConfig};
pub use file::{FileDriver, FileDriverClass};
pub use memory::{MemoryDriver, MemoryDriverClass};
