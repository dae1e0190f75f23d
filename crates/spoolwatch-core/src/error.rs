// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for spoolwatch.

use thiserror::Error;

/// Top-level error type for all spoolwatch operations.
#[derive(Debug, Error)]
pub enum SpoolwatchError {
    // -- Discovery errors --
    #[error("printer discovery failed: {0}")]
    Discovery(String),

    #[error("malformed browse packet: {0}")]
    BrowsePacket(String),

    // -- Print service errors --
    #[error("IPP request failed: {0}")]
    IppRequest(String),

    #[error("print service unavailable: {0}")]
    PrintService(String),

    // -- Configuration --
    #[error("configuration error: {0}")]
    Config(String),

    // -- Storage / OS --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SpoolwatchError>;
