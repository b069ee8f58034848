// SPDX-License-Identifier: Apache-2.0

//! Tessera: session, dispatch and transport core of a federated query
//! engine.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod entitlement;
pub mod metrics;
pub mod observability;
pub mod resolver;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod validator;

pub use tessera_core as core_types;
pub use tessera_core::{EngineError, EngineResult};

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
