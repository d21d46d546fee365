//! Locates LCEVC enhancement data inside access units of a base elementary
//! stream, and optionally splices it out so the base decoder never sees it.
//!
//! Enhancement data travels either as an SEI message (ITU-T T.35 registered
//! user data) or as a dedicated LCEVC NAL unit type, inside an Annex B or
//! length-prefixed stream. The [`bin`] module reads and writes the `lcevcbin`
//! container used to carry enhancement data out-of-band.
#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(unsafe_code)]

pub mod bin;

mod error;
mod extract;
mod nal;

pub use self::error::ExtractError;
pub use self::extract::{
    Extracted, Stripped, extract_enhancement, extract_enhancement_if_keyframe,
    extract_and_remove_enhancement, extract_and_remove_enhancement_if_keyframe,
};
pub use self::nal::{CodecType, NalFormat};
