//! Command intake for the control plane
//!
//! This module handles:
//! - Parsing raw producer input
//! - Accumulating every field violation in one pass
//! - Normalizing the region into its canonical name

mod template;
mod validator;

pub use template::CommandTemplate;
pub use validator::{CommandValidator, FieldViolation, ValidationError};
