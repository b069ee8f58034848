// SPDX-License-Identifier: Apache-2.0

//! Fragment planning, dispatch to connectors and result assembly.

pub mod executor;
pub mod lanes;
pub mod memory;
pub mod planner;
pub mod registry;
pub mod types;

pub use executor::{DispatchCore, PreparedRequest, WarningSink};
pub use lanes::TransactionLanes;
pub use memory::MemoryConnector;
pub use planner::{ModelPlanner, Planner};
pub use registry::ConnectorRegistry;
pub use types::{FragmentResult, PlannedFragment, RequestResults};
