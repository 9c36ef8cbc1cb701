#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

//! The strand common library.
//!
//! Shared components of the strand media edge server: blob identity,
//! the stream descriptor codec, chunk decryption and the byte-range
//! arithmetic used by the stream reader.

pub mod blob;
pub mod descriptor;
pub mod error;
pub mod media_type;
pub mod range;

pub use error::{StrandError, StrandResult};
