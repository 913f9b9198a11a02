pub mod btle;
pub mod codec;
pub mod constants;
pub mod link;
pub mod supervisor;
pub mod transport;
pub mod types;
