pub mod cost;
pub mod executor;
pub mod history;
pub mod planner;
