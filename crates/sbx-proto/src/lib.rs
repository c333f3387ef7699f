//! Wire contract for the sandbox server front door.

pub mod messages;
pub mod validation;

pub use messages::*;
pub use validation::{validate_exec_body, validate_limits, validate_request, ValidationError};
