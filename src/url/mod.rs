//! URL handling: normalization, host extraction, and domain scoping
//!
//! The normalized form produced here is the dedup key for pages and frontier
//! entries, so normalization must be deterministic and idempotent.

mod domain;
mod normalize;

pub use domain::{extract_domain, in_scope};
pub use normalize::normalize_url;
