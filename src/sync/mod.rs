//! Synchronization primitives built on the dispatch runtime.

mod group;
mod keyed;
mod semaphore;

pub use group::Group;
pub use keyed::KeyedBlockQueue;
pub use semaphore::Semaphore;
