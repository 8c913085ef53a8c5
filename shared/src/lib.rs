pub mod keaconfig;
pub mod protocol;
pub mod types;
