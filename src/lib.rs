pub mod command;
pub mod logging;
pub mod manager;
pub mod task;
pub mod termination;
