//! Wire-format structs and encode/decode helpers for the five canonical
//! service protocols (spec component C10), sharing a common bounds-checked
//! primitive reader/writer instead of a schema/IDL compiler.

pub mod blk;
pub mod display;
pub mod fs;
pub mod input;
pub mod net;
pub mod wire;

pub use wire::WireError;
