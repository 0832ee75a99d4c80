// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pairing rules between request and response messages

use crate::messages::NsMessage;
use thiserror::Error;

/// Protocol-level failure: a frame that decodes but does not belong.
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("message {0} is not a request")]
    NotARequest(&'static str),
    #[error("message {0} is not a response")]
    NotAResponse(&'static str),
    #[error("response {got} does not answer request {want}")]
    Mismatch { want: &'static str, got: &'static str },
    #[error("json codec: {0}")]
    Codec(#[from] serde_json::Error),
}

pub fn is_request(msg: &NsMessage) -> bool {
    matches!(
        msg,
        NsMessage::LookupRequest(_)
            | NsMessage::OpenFileRequest(_)
            | NsMessage::ReadFileRequest(_)
            | NsMessage::WriteFileRequest(_)
            | NsMessage::ReadDirRequest(_)
    )
}

pub fn is_response(msg: &NsMessage) -> bool {
    !is_request(msg)
}

/// The response tag a given request must be answered with.
fn expected_response(req: &NsMessage) -> &'static str {
    match req {
        NsMessage::LookupRequest(_) => "LookupResponse",
        NsMessage::OpenFileRequest(_) => "OpenFileResponse",
        NsMessage::ReadFileRequest(_) => "ReadFileResponse",
        NsMessage::WriteFileRequest(_) => "WriteFileResponse",
        NsMessage::ReadDirRequest(_) => "ReadDirResponse",
        other => other.kind(),
    }
}

/// Check that `res` is a legal answer to `req`. An `ErrorResponse` answers
/// any request.
pub fn validate_exchange(req: &NsMessage, res: &NsMessage) -> Result<(), ProtoError> {
    if !is_request(req) {
        return Err(ProtoError::NotARequest(req.kind()));
    }
    if !is_response(res) {
        return Err(ProtoError::NotAResponse(res.kind()));
    }
    if res.is_error() {
        return Ok(());
    }
    let want = expected_response(req);
    if res.kind() != want {
        return Err(ProtoError::Mismatch {
            want,
            got: res.kind(),
        });
    }
    Ok(())
}
