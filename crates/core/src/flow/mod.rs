// Flow definitions: graph construction, validation, and file loading

pub mod dag;
pub mod loader;
pub mod validator;

pub use dag::FlowDag;
pub use loader::{load_flow_dir, load_flow_file};
pub use validator::{validate_flow, Validation};
