// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! shimfs cross-namespace request pipeline
//!
//! The main instance cannot operate on namespaced resources directly, so it
//! delegates to a short-lived copy of its own binary: [`event`] launches
//! the helper and runs the framed exchange over a socket pair, [`helper`]
//! is the code that runs on the other side after re-exec, attached to the
//! target process's namespaces.

pub mod event;
pub mod helper;

pub use event::NsenterLauncher;
pub use helper::{is_helper_invocation, HELPER_ARG, INIT_PIPE_ENV, INIT_PIPE_FD};
