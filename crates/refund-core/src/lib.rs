//! Domain types shared across the adjudication pipeline.
//!
//! Every type here is a plain data record; behavior lives in the crates
//! that own a given stage (extraction, verification, adjudication, the
//! policy compiler). Keeping this crate free of logic means every other
//! crate can depend on it without pulling in an async runtime or an I/O
//! adapter.

pub mod events;
pub mod graph;
pub mod intent;
pub mod mail;
pub mod orders;

pub use events::{PipelineEvent, StepStatus};
pub use graph::Citation;
pub use intent::{ItemCondition, OrderIntent, ReturnCategory, ReturnReasonCategory};
pub use mail::{Attachment, CaseEnvelope, Classification, MailCategory, NormalizedMessage};
pub use orders::{Customer, Order, OrderItem, RefundCase, VerificationStatus};
