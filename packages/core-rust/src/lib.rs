//! `brokerline` core: wire envelopes, request intentions, and structural schemas.
//!
//! This crate has no runtime dependencies beyond `serde`. It defines the shape
//! of everything that crosses the broker boundary so that the service crate
//! and any requester implementation agree on one vocabulary.

pub mod envelope;
pub mod intention;
pub mod schema;

pub use envelope::{status, ErrorEnvelope, InboundMessage, OutboundResponse};
pub use intention::Intention;
pub use schema::{EnvelopeSchema, EnvelopeValidator, FieldDef, FieldKind, ValidationResult};
