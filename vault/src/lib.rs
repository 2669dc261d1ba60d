//! File-queue orchestrator for an autonomous "employee" agent.
//!
//! Work items are Markdown files with YAML front matter that move through a
//! vault of stage directories (`Inbox/` to `Done/`). Every transition is a
//! single atomic rename, so the filesystem itself is the queue and the lock.
//!
//! - **[`core`]**: Pure logic (stages, front matter, response parsing, budgets,
//!   approval documents, error classification). No I/O.
//! - **[`io`]**: Filesystem, process, HTTP and audit side effects.
//!
//! Orchestration modules ([`intake`], [`processor`], [`ralph`], [`gate`],
//! [`reconcile`], [`daemon`]) combine the two through a [`runtime::Runtime`].

pub mod core;
pub mod daemon;
pub mod exit_codes;
pub mod gate;
pub mod intake;
pub mod io;
pub mod logging;
pub mod processor;
pub mod ralph;
pub mod reconcile;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
