//! Site Deployer Library
//!
//! Versioned static-site deployments: publish a build to an object store,
//! capture it as a restorable version, and invalidate the CDN in front of
//! it at minimal cost.

pub mod app;
pub mod artifacts;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod invalidation;
pub mod logs;
pub mod models;
pub mod providers;
pub mod publish;
pub mod retry;
pub mod storage;
pub mod utils;
