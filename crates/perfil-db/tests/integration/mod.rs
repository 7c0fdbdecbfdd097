pub mod common;
mod queue_tests;
mod stage_tests;
