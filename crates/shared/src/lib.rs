pub mod domain;
pub mod error;
pub mod grid;
pub mod pricing;
pub mod protocol;
