mod keeper;
mod registry;

pub use keeper::LockTableKeeper;
pub use registry::{BindingRegistry, ClusterBindingRegistry};
