// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// RelayForge - Common Library
// Shared types, error taxonomy, and domain helpers for the reverse-tunnel subsystem.

pub mod domain;
pub mod error;
pub mod types;

pub use domain::{best_match, is_valid_domain, similarity};
pub use error::{Error, Result};
pub use types::{CertAuthority, CertRole, SiteStatus};
