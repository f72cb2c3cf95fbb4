//! Object Metadata Service
//!
//! Keeps a derived-metadata record per object version in step with the
//! object store's change notifications. Notifications arrive at least once
//! and in any order; the service runs each one through a fixed set of
//! extractors and persists the merged result so that the stored record always
//! reflects the notification with the greatest sequencer seen.
//!
//! ## Features
//!
//! - **Order-independent ingestion**: every write is a conditional
//!   compare-and-set on the source sequencer, so duplicates and late arrivals
//!   resolve to `Outdated` instead of clobbering newer state
//! - **Composable extraction**: label detection, image header/EXIF and
//!   object-size extractors, configured as an ordered list with
//!   deterministic last-write-wins merging
//! - **Pluggable persistence**: PostgreSQL, DynamoDB or in-memory record
//!   stores behind one trait, each with an atomic conditional write
//! - **HTTP invocation surface**: one notification per request, with health,
//!   readiness and record lookup routes
//!
//! ## Architecture
//!
//! ```text
//! Event bus (at-least-once)
//! ┌──────────────┐
//! │ POST         │
//! │ /v1/events   │
//! └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐  stale    ┌──────────────┐
//! │ Handler      │──────────▶│ Outdated     │
//! │ (pre-check)  │           └──────────────┘
//! └──────────────┘
//!        │ create                 S3 / Rekognition
//!        ▼                        ┌──────────────┐
//! ┌──────────────┐  concurrent    │ Object       │
//! │ Composite    │───────────────▶│ Source       │
//! │ Extractor    │                │ Label        │
//! └──────────────┘                │ Detector     │
//!        │ merged fragment        └──────────────┘
//!        ▼
//! ┌──────────────┐           ┌──────────────────────┐
//! │ Idempotent   │──────────▶│ PostgreSQL │ DynamoDB │
//! │ Store        │ cond. put │ Memory               │
//! └──────────────┘           └──────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod extraction;
pub mod handler;
pub mod label_detector;
pub mod object_source;
pub mod ordering;
pub mod store;

pub use api::AppState;
pub use config::Config;
pub use error::{Error, Result};
pub use event::{ChangeEvent, EventKind, IdentityKey, Sequencer};
pub use extraction::{CompositeExtractor, Extractor};
pub use handler::{Handler, InvocationResult, Outcome};
pub use label_detector::{LabelDetector, RekognitionDetector};
pub use object_source::{ObjectSource, S3ObjectSource};
pub use ordering::Freshness;
pub use store::{
    CommitResult, DynamoDbStore, IdempotentStore, MemoryStore, MetadataRecord, PostgresStore,
    RecordStore,
};
