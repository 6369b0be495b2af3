pub mod canonical;
pub mod types;
pub mod validate;

pub use canonical::{canonical_bytes, canonicalize_json_value, content_hash};
pub use types::*;
pub use validate::{validate_card, CardError, CardErrors, ValidCard};

#[cfg(test)]
mod tests;
