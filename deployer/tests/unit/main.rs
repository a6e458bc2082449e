//! Integration tests for the deployment pipeline

mod common;
mod test_artifacts;
mod test_orchestrator;
mod test_publish;
mod test_rollback;
