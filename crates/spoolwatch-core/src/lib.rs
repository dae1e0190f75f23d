// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolwatch — shared domain for the print-queue discovery daemon:
// error type, configuration, and the browse allow-list.

pub mod allow;
pub mod config;
pub mod error;

pub use allow::{AllowList, AllowRule};
pub use config::Config;
pub use error::SpoolwatchError;
