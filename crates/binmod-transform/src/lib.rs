//! The whole-module transformation pipeline.
//!
//! [`transform`] applies a fixed sequence of passes that lower, normalize,
//! analyze, and optimize the opcode stream produced by `binmod-lower`:
//! flattening nested definitions, deciding bit-field sizes, binding coder
//! functions to formats, dependency-sorting formats, merging conditional
//! fields, deriving property functions, analyzing coder capability flags,
//! expanding bit operations into byte-oriented fallbacks, applying
//! byte-order fallbacks, and finalizing layout. The identifier-to-index
//! table is rebuilt after every mutating pass.

pub mod bind;
pub mod bit_field;
pub mod bit_op;
pub mod cfg;
pub(crate) mod emit;
pub mod endian;
pub mod error;
pub mod finalize;
pub mod flatten;
pub mod merge_cond;
pub mod property;
pub mod sort_formats;
pub mod traits;

use binmod_core::Module;

pub use error::TransformError;

/// Runs the full pass pipeline over a freshly lowered module.
pub fn transform(m: &mut Module) -> Result<(), TransformError> {
    flatten::flatten(m)?;
    m.rebind_ident_index();
    bit_field::decide_bit_field_size(m)?;
    m.rebind_ident_index();
    bind::bind_encoder_decoder(m)?;
    m.rebind_ident_index();
    sort_formats::sort_formats(m)?;
    m.rebind_ident_index();
    bind::replace_call_coder_refs(m)?;
    m.rebind_ident_index();
    merge_cond::merge_conditional_fields(m)?;
    m.rebind_ident_index();
    property::derive_property_functions(m)?;
    m.rebind_ident_index();
    traits::analyze_coder_traits(m)?;
    bit_op::expand_bit_operation(m)?;
    m.rebind_ident_index();
    endian::apply_native_endian_fallback(m)?;
    m.rebind_ident_index();
    endian::apply_dynamic_endian_fallback(m)?;
    m.rebind_ident_index();
    finalize::sort_functions_into_formats(m)?;
    m.rebind_ident_index();
    finalize::sort_immediates(m)?;
    m.rebind_ident_index();
    cfg::generate_cfg(m)?;
    finalize::add_ident_ranges(m)?;
    finalize::remap_programs(m)?;
    finalize::optimize_type_usage(m)?;
    m.rebind_ident_index();
    Ok(())
}
