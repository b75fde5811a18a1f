//! Runtime object model and the abstract machine.

pub mod context;
pub mod layout;
pub mod machine;
