//! Integration tests: the full pipeline against in-process fakes, and the
//! HTTP providers against local axum servers.

mod fakes;
mod providers;
