pub mod manifest;
pub mod scan;
pub mod store;
