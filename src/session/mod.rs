// SPDX-License-Identifier: Apache-2.0

//! Identity and session lifecycle.

pub mod auth;
pub mod manager;

pub use auth::{AccountState, AuthenticatedUser, Authenticator, Credentials, PasswordAuthenticator};
pub use manager::{SessionCloseReason, SessionInfo, SessionListener, SessionService};
