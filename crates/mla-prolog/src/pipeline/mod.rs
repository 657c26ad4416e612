mod cache;
mod context;
mod executor;
mod flags;
mod io;
mod matmul;
mod matrix;
mod precision;
mod schedule;
mod tensor;
mod vector;

pub use cache::*;
pub use context::*;
pub use executor::*;
pub use flags::*;
pub use io::*;
pub use matmul::*;
pub use matrix::*;
pub use precision::*;
pub use schedule::*;
pub use tensor::*;
pub use vector::*;
