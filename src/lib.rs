//! Concurrent file generation: a dispatcher hands offset ranges to a pool of
//! pattern workers, and a single sink writes each chunk at its offset while
//! folding it into a BLAKE3 digest. Everything shares one cancellable
//! lifetime owned by [`shutdown::ShutdownCoordinator`].

#[macro_use]
extern crate log;

pub mod buffer_pool;
pub mod checksum;
pub mod config;
pub mod dispatcher;
pub mod file_writer;
pub mod generate;
pub mod pattern;
pub mod pipeline;
pub mod progress_reporter;
pub mod shared_types;
pub mod shutdown;
pub mod size_utils;
pub mod validation;
