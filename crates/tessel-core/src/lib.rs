//! # tessel-core
//!
//! Blobs, shapes and the mixed-precision numeric model for tessel.
//!
//! This crate provides:
//! - [`Shape`]: N-D shape with the legacy (num, channels, height, width) view
//! - [`DType`], [`Element`], [`Accumulator`]: storage and compute scalars
//! - [`Precision`]: the (storage, compute) policy bound to arenas and layers
//! - [`BlobArena`] / [`BlobId`]: handle-based blobs with shared storage slots
//! - [`Error`] / [`Result`]: the error type used across the workspace

pub mod arena;
pub mod blob;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod storage;

pub use half;

pub use arena::BlobArena;
pub use blob::{Blob, BlobId, SlotId};
pub use dtype::{Accumulator, DType, Element, Precision};
pub use error::{Error, Result};
pub use shape::Shape;
pub use storage::Storage;
