pub mod identity;
pub mod remote;
