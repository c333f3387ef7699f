//! Shape validation for decoded requests.
//!
//! Only wire-level rules live here (required fields, limit positivity);
//! name grammars are enforced by the services that own them.

use crate::messages::*;
use thiserror::Error;

/// Validation error.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),
}

fn invalid<S: Into<String>>(message: S) -> ValidationError {
    ValidationError::Invalid(message.into())
}

/// Validate a decoded RPC request against its logical schema.
pub fn validate_request(request: &Request) -> Result<(), ValidationError> {
    match request {
        Request::Ping => Ok(()),
        Request::RunCommand(req) => {
            require_session_id(&req.session_id)?;
            if req.command.is_empty() {
                return Err(invalid("command must have at least one element"));
            }
            validate_limits(req.time_ms, req.mem_kb, req.fsize_kb, req.nofile)
        }
        Request::WriteFile(req) => {
            require_session_id(&req.session_id)?;
            require_path(&req.path)
        }
        Request::ReadFile(req) => {
            require_session_id(&req.session_id)?;
            require_path(&req.path)
        }
        Request::ListDir(req) => {
            require_session_id(&req.session_id)?;
            require_path(&req.path)
        }
        Request::SetEnv(req) => require_session_id(&req.session_id),
        Request::SetCwd(req) => {
            require_session_id(&req.session_id)?;
            if req.cwd.is_empty() {
                return Err(invalid("cwd must not be empty"));
            }
            Ok(())
        }
    }
}

/// Validate an HTTP exec body.
pub fn validate_exec_body(body: &ExecBody) -> Result<(), ValidationError> {
    if body.command.is_empty() {
        return Err(invalid("command must have at least one element"));
    }
    validate_limits(body.time_ms, body.mem_kb, body.fsize_kb, body.nofile)
}

/// Optional limits must be positive when present.
pub fn validate_limits(
    time_ms: Option<u64>,
    mem_kb: Option<u64>,
    fsize_kb: Option<u64>,
    nofile: Option<u64>,
) -> Result<(), ValidationError> {
    for (name, value) in [
        ("time_ms", time_ms),
        ("mem_kb", mem_kb),
        ("fsize_kb", fsize_kb),
        ("nofile", nofile),
    ] {
        if value == Some(0) {
            return Err(invalid(format!("{} must be positive", name)));
        }
    }
    Ok(())
}

fn require_session_id(session_id: &str) -> Result<(), ValidationError> {
    if session_id.is_empty() {
        return Err(invalid("session_id is required"));
    }
    Ok(())
}

fn require_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(invalid("path is required"));
    }
    Ok(())
}
