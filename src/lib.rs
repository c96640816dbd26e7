//! htee: a streaming HTTP tee.
//!
//! Pipe bytes in over a chunked `POST` and fan them out live to any number
//! of `GET` readers, with the whole stream durably appended to a shared
//! store so late readers catch up from the beginning.
//!
//! This crate is the workspace facade and the home of the end-to-end
//! integration suites under `tests/integration/`.  The daemon lives in
//! `services/hteed`, the `htee` CLI in `services/htee-client`, and the
//! engine layers in the crates re-exported below.

pub use htee_store as store;
pub use htee_stream as stream;
