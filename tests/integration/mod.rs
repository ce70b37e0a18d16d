//! Integration tests for the easel studio
//!
//! Exercises the HTTP API surface and the end-to-end generation flow
//! against tiny local fixtures; nothing here touches the network.

mod api_tests;
mod fixtures;
mod studio_tests;

/// Common test initialization
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("easel=debug")
        .try_init();
}
