// SPDX-License-Identifier: Apache-2.0

//! Tessera core: identifiers, envelopes, the resolved command tree,
//! collaborator traits and the shared error taxonomy.

pub mod codec;
pub mod command;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod session;
pub mod traits;
pub mod transaction;
pub mod value;

pub use codec::WireFormat;
pub use envelope::{AtomicRequestMessage, AtomicResultsMessage};
pub use error::{EngineError, EngineResult, LogonFailureKind};
pub use ids::{AtomicRequestId, ExecutionCounter, RequestId, SessionId};
pub use session::{LogonResult, SessionSecret, SessionToken, VdbRef};
pub use traits::*;
pub use transaction::{TransactionContext, TransactionScope};
pub use value::{Batch, Row, Value};
