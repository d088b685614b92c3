pub mod account;
pub mod floor;

pub use account::*;
pub use floor::*;
