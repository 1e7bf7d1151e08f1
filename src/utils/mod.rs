//! Small shared helpers with no workflow semantics of their own.

pub mod ids;
pub mod trace;

pub use ids::IdGenerator;
pub use trace::init_tracing;
