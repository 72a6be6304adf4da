//! Crash-consistent on-disk persistent sequence container.
//!
//! Three stacked subsystems, each usable on its own:
//!
//! 1. [`buffer`]: byte buffers over a file with configurable durability and
//!    an explicit write-ordering primitive, the *barrier*.  Includes the
//!    crash-safe [`TwoCopyBarrierBuffer`], which commits cached writes with
//!    a rename-based atomic swap between two file copies.
//! 2. [`block`]: block allocators over a buffer — fixed-size slots over an
//!    allocation bitmap, or power-of-two buddy blocks — with O(1) iteration
//!    over live blocks and recovery-friendly on-disk state.
//! 3. [`list`]: a doubly-linked persistent deque over a block allocator,
//!    with per-operation crash consistency and automatic repair of a single
//!    interrupted mutation at open time.
//!
//! Element values are encoded by [`serialize::Serializer`] implementations;
//! built-in codecs cover the primitive types.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate tracing;

pub mod buffer;
pub use buffer::{
    open_buffer, BufferError, FileBuffer, MappedBuffer, PersistentBuffer, ProtectionLevel,
    SegmentedBuffer, TwoCopyBarrierBuffer, TwoCopyConfig, TwoCopyConfigBuilder,
};

pub mod block;
pub use block::{BlockError, DynamicBlockBuffer, FixedBlockBuffer, PersistentBlockBuffer};

pub mod serialize;
pub use serialize::{Persistable, Serializer};

pub mod list;
pub use list::{ListError, PersistentLinkedList};

#[cfg(test)]
pub(crate) mod test;
