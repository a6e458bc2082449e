pub mod deployment;
pub mod invalidation;
