//! An append-only log-structured filesystem for raw SLC NAND.
//!
//! The crate provides a flat namespace of byte-stream files over a bare
//! NAND array, sized for controllers with a few kilobytes of RAM: files
//! are written strictly sequentially, read sequentially from the start,
//! and never rewritten in place. Block allocation is biased towards the
//! least-worn free blocks, erase counters survive across reuse, and a
//! single mount pass repairs whatever a power loss left half-done.
//!
//! The host supplies the medium by implementing [`NandFlash`]; the crate
//! ships [`MemNand`], a RAM-backed array with real NAND programming
//! semantics, for tests and volatile use.
//!
//! ```no_run
//! use flogfs::{Flogfs, Geometry, MemNand};
//!
//! # fn main() -> Result<(), flogfs::FsError> {
//! let dev = MemNand::new(Geometry {
//!     sector_size: 512,
//!     sectors_per_page: 4,
//!     pages_per_block: 64,
//!     blocks: 1024,
//! });
//! let fs = Flogfs::new(dev)?;
//! fs.format()?;
//! fs.mount()?;
//!
//! let mut wf = fs.open_write("boot.log")?;
//! fs.write(&mut wf, b"power on")?;
//! fs.close_write(wf)?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod errors;
pub mod memnand;
pub mod nand;

mod allocator;
mod file;
mod fs;
mod inode;
mod layout;
mod media;

pub use errors::{CanFail, FlashError, FsError, FsResult, ReadIntegrity};
pub use fs::{FileLister, Flogfs, ReadFile, WriteFile};
pub use layout::Filename;
pub use memnand::MemNand;
pub use nand::{Geometry, NandFlash, MAX_FILENAME_LEN, SPARE_LEN};
