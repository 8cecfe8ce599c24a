//! PeerDB core data model.
//!
//! Pure types shared by every layer: identifiers, timestamps, units, claims,
//! documents, core properties, and the filter algebra. No I/O lives here —
//! the server crate owns compilation, aggregation, and all adapters.

pub mod claim;
pub mod document;
pub mod filter;
pub mod identifier;
pub mod props;
pub mod time;
pub mod unit;

pub use claim::{Claim, ClaimMeta, ClaimVisitor, DocumentRef, PropertyRef, VisitDecision};
pub use document::{Document, DuplicateClaim};
pub use filter::{Filters, FilterViolation};
pub use identifier::{Identifier, IdentifierError, IDENTIFIER_LEN};
pub use time::{TimePrecision, Timestamp, TimestampError};
pub use unit::{AmountUnit, AMOUNT_UNITS_TOTAL};
