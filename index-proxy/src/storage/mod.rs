//! Concrete `index_cache::Storage` back-ends.

pub mod local_fs;
