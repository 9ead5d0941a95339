// statesync-common: wire types and pure ordering logic shared by statesync crates

pub mod ordering;
pub mod protocol;
pub mod types;
