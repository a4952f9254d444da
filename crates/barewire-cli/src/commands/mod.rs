pub mod rewrite;
pub mod types;
