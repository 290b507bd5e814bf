//! vixdump: exchange VM disk images with a backup orchestrator as a
//! framed byte stream over standard input/output.
//!
//! # Architecture
//!
//! ```text
//! dump:
//! +---------+     +--------------+     +-----------------+
//! | backend | --> |   session    | --> | stdout (stream) |
//! | (disk)  |     | changed ∩    |     | + raw mirror    |
//! +---------+     | allocated    |     +-----------------+
//!                 +--------------+
//!
//! restore / show:
//! +----------------+     +--------------+     +---------+
//! | stdin (stream) | --> |   session    | --> | backend |
//! +----------------+     +--------------+     +---------+
//! ```
//!
//! The session moves sector-aligned chunks between a disk backend and
//! the stream, saving only ranges that are both changed (per the
//! snapshot's change tracking) and still allocated. With `-m` a copy
//! pipeline overlaps backend I/O with stream I/O; order on the wire is
//! identical either way.
//!
//! The proprietary remote disk library is reached only through the
//! [`backend::Backend`] and [`backend::VirtualDisk`] traits; this crate
//! ships a local flat-image driver and an in-memory test backend.

pub mod backend;
pub mod error;
pub mod extent;
pub mod session;
pub mod stream;
pub mod workfile;

/// Fixed 512-byte sector; the backend addresses everything in these units.
pub const SECTOR_SIZE: u64 = 512;

pub use error::{DumpError, Result};
pub use extent::{Extent, Intersection};
pub use session::{dump, restore, show, DumpStats, SessionOptions};
