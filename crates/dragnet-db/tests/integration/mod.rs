pub mod common;
mod task_store_tests;
