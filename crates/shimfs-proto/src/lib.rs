// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! shimfs wire protocol — message types, framing and validation
//!
//! This crate defines the JSON message schema exchanged between the shimfs
//! main instance and the short-lived namespace-enter helper, plus the
//! length-prefixed framing both ends speak over their socket pair.

pub mod frame;
pub mod messages;
pub mod validation;

pub use frame::{read_frame, write_frame, MAX_FRAME};
pub use messages::{
    ErrorPayload, FileInfo, LookupPayload, NsEvent, NsKind, NsMessage, OpenFilePayload,
    ReadDirPayload, ReadFilePayload, StatData, WriteFilePayload,
};
pub use validation::{validate_exchange, ProtoError};
