//! seqrun — a persistent, project-scoped command queue that enforces
//! strict serial execution of developer-tool commands (linters,
//! type-checkers, test runners, formatters, VCS operations), tracks and
//! reaps every descendant process of each command, and exposes a
//! CI-style run/job history.
//!
//! One module per component:
//!
//! | Component | Module |
//! |-----------|--------|
//! | C1 Process Supervisor | [`supervisor`] |
//! | C2 Memory Monitor | [`memmon`] |
//! | C3 Runner Enforcer | [`launcher`] (+ [`catalog`]) |
//! | C4 Tool Atomifier | [`atomify`] |
//! | C5 Queue Store | [`queue`] (+ [`locks`], [`project`]) |
//! | C6 Run/Job Recorder | [`recorder`] |
//! | C7 Queue Engine | [`engine`] |

pub mod atomify;
pub mod catalog;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod launcher;
pub mod locks;
pub mod logging;
pub mod memmon;
pub mod project;
pub mod queue;
pub mod readmodel;
pub mod recorder;
pub mod signal;
pub mod supervisor;
