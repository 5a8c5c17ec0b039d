pub mod docker;
pub mod remote;
