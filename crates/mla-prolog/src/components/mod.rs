mod elem;
mod error;
mod problem;
mod scenario;
mod selector;
mod shape;

pub use elem::*;
pub use error::*;
pub use problem::*;
pub use scenario::*;
pub use selector::*;
pub use shape::*;
