// SPDX-License-Identifier: Apache-2.0

//! Pre-execution security checks.
//!
//! Both validators run over the same flattened symbol list and abort the
//! command before any fragment is dispatched.

pub mod authorization;
pub mod symbols;
pub mod visibility;

pub use authorization::{AuthorizationValidator, ExemptProcedures, DEFAULT_EXEMPT_PROCEDURES};
pub use visibility::VisibilityValidator;
