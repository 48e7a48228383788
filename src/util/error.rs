/// エラー型と、リトライ可否の分類ユーティリティ。
use std::io;

use anyhow::Error;
use reqwest::StatusCode;
use sqlx::Error as SqlxError;
use uuid::Uuid;

use crate::clients::batch_api::BatchApiError;
use crate::store::dao::types::WorkStatus;

/// Errors surfaced to callers of the stage engine and bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("dataset {fingerprint} was already submitted by work {existing}")]
    DuplicateDataset { fingerprint: String, existing: Uuid },
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: WorkStatus, to: WorkStatus },
    #[error("work {0} not found")]
    WorkNotFound(Uuid),
    #[error("no runner registered under key {0:?}")]
    RunnerNotRegistered(String),
    #[error("dataset line {line} is {size} bytes, over the {limit} byte chunk limit")]
    LineTooLarge {
        line: usize,
        size: usize,
        limit: usize,
    },
    #[error("work {id} is already being processed (pid {pid:?})")]
    AlreadyRunning { id: Uuid, pid: Option<u32> },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WorkError {
    /// Errors that must reach the caller without forcing the work into `Failed`.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            WorkError::DuplicateDataset { .. }
                | WorkError::InvalidTransition { .. }
                | WorkError::WorkNotFound(_)
                | WorkError::AlreadyRunning { .. }
                | WorkError::RunnerNotRegistered(_)
        )
    }

    /// One-line rendering that keeps the whole cause chain.
    #[must_use]
    pub fn report(&self) -> String {
        match self {
            WorkError::Internal(inner) => format!("{inner:#}"),
            other => other.to_string(),
        }
    }

    /// Unwraps an `anyhow` error that carries a `WorkError` back into the typed form.
    #[must_use]
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        match error.downcast::<WorkError>() {
            Ok(work_error) => work_error,
            Err(other) => WorkError::Internal(other),
        }
    }
}

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 一時的なエラー。次のチェックサイクルで再試行する。
    Retryable,
    NonRetryable,
    /// 認証エラーなど、再試行しても回復しないもの。
    Fatal,
}

fn classify_status(status: StatusCode) -> Option<ErrorKind> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Some(ErrorKind::Retryable);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(ErrorKind::Fatal),
        s if s.is_client_error() => Some(ErrorKind::NonRetryable),
        _ => None,
    }
}

/// Walks the error chain and decides whether the failure is transient.
#[must_use]
pub fn classify_error(error: &Error) -> ErrorKind {
    for cause in error.chain() {
        if let Some(api_err) = cause.downcast_ref::<BatchApiError>() {
            match api_err {
                BatchApiError::Status { status, .. } => {
                    if let Some(kind) = classify_status(*status) {
                        return kind;
                    }
                }
                BatchApiError::Transport(inner) => {
                    if inner.is_timeout() || inner.is_connect() || inner.is_body() {
                        return ErrorKind::Retryable;
                    }
                }
                BatchApiError::Decode(_) => return ErrorKind::NonRetryable,
                BatchApiError::Io(_) => {}
            }
        }

        if let Some(reqwest_err) = cause.downcast_ref::<reqwest::Error>() {
            if reqwest_err.is_timeout() || reqwest_err.is_connect() {
                return ErrorKind::Retryable;
            }
            if let Some(kind) = reqwest_err.status().and_then(classify_status) {
                return kind;
            }
        }

        if let Some(sqlx_err) = cause.downcast_ref::<SqlxError>() {
            match sqlx_err {
                SqlxError::PoolTimedOut | SqlxError::PoolClosed => return ErrorKind::Retryable,
                SqlxError::Configuration(_) => return ErrorKind::Fatal,
                _ => {}
            }
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            // Body streams surface transport failures as io::Error wrapping reqwest::Error.
            if io_err
                .get_ref()
                .is_some_and(|inner| inner.downcast_ref::<reqwest::Error>().is_some())
            {
                return ErrorKind::Retryable;
            }
            if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::Interrupted
            ) {
                return ErrorKind::Retryable;
            }
        }
    }

    ErrorKind::NonRetryable
}

#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    matches!(classify_error(error), ErrorKind::Retryable)
}
