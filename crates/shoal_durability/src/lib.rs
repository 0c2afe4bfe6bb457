pub mod durability;

pub use durability::*;
