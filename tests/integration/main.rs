//! Integration tests

mod handler_tests;
mod lifecycle_tests;
mod otlp_tests;
