mod partition;
mod plan;
mod workspace;

pub use partition::*;
pub use plan::*;
pub use workspace::*;
