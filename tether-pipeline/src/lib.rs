//! Stage chain framework for device-side cloud clients.
//!
//! A pipeline is an ordered chain of [`Stage`]s owned by a single executor
//! task. [`Operation`]s travel down the chain from the root towards a leaf
//! transport and are completed exactly once; [`Event`]s produced by the leaf
//! travel up towards the root, where they are handed to the handlers
//! registered on the [`PipelineBuilder`].

mod completion;
mod connection;
mod correlation;
mod error;
mod event;
mod model;
mod operation;
mod pipeline;
mod stage;

pub mod http;
pub mod mqtt;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use completion::{Completer, Pending, completion};
pub use connection::{ConnectionStage, ConnectionState};
pub use correlation::{CorrelationConfig, CorrelationStage};
pub use error::PipelineError;
pub use event::Event;
pub use model::*;
pub use operation::{OpId, OpKind, Operation};
pub use pipeline::{PipelineBuilder, PipelineHandle};
pub use stage::{Context, Stage};

pub use tether_util::types::RequestId;
