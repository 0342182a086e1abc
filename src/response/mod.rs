//! Response handling module - base64 payloads and image files on disk

pub mod base64;
pub mod file;

pub use file::ImageStore;
