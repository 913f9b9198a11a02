pub mod collaborators;
pub mod coordinator;
pub mod timer;
