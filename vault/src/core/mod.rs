//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! documents and values and return deterministic outputs suitable for tests.

pub mod approval;
pub mod backoff;
pub mod budget;
pub mod external;
pub mod frontmatter;
pub mod response;
pub mod stage;
pub mod types;
