//! Physical memory sources.

pub mod mmap_file;

pub use mmap_file::MmapFileLayer;
