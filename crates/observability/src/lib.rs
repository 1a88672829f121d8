//! Process-wide tracing setup shared by binaries and tests.

/// Initialize structured logging for the process.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize human-readable logging captured by the test harness.
pub fn init_test() {
    tracing::init_test();
}

/// Subscriber configuration (filters, formats).
pub mod tracing;
