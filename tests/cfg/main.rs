//! cfg 模块集成测试

mod bind_tests;
mod common;
mod manager_tests;
mod sources_tests;
