#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::float_cmp,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Documentation lints: internal/self-documenting functions don't need extensive docs.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Cast safety: casts are bounded by real-world corpus sizes (passage counts, page numbers).
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]

//! Core indexing and retrieval engine for AutoAssist.
//!
//! AutoAssist answers free-text vehicle-maintenance questions by ranking
//! short passages of workshop-manual text against a user query. This crate
//! implements the whole pipeline behind that:
//!
//! - [`segment`] turns raw page text into passage-sized chunks.
//! - [`ingest`] appends passage records to per-manufacturer JSONL partitions.
//! - [`index`] fits a deterministic TF-IDF vector space over the corpus and
//!   publishes it as an immutable, atomically replaced snapshot.
//! - [`normalize`] expands colloquial query phrasing into manual terminology.
//! - [`detect`] infers a vehicle manufacturer from the query text.
//! - [`search`] embeds a query into a loaded snapshot and returns ranked,
//!   optionally manufacturer-boosted passages.
//!
//! Everything upstream of raw page text (PDF extraction, upload UI) and
//! downstream of ranked hits (interactive display) lives outside this crate.

/// The autoassist-core crate version (matches `Cargo.toml`).
pub const AUTOASSIST_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod constants;
pub mod detect;
pub mod error;
pub mod index;
pub mod ingest;
pub mod manuals;
pub mod normalize;
pub mod search;
pub mod segment;
pub mod types;

pub use config::CorpusLayout;
pub use detect::{DirectoryRegistry, MakeRegistry, ManufacturerDetector};
pub use error::{AutoAssistError, Result};
pub use index::{
    BuildReport, IndexBuilder, IndexSnapshot, SnapshotStore, SparseVector, TermMatrix, TfidfModel,
};
pub use ingest::{
    IngestReport, ManualSource, PageText, PartitionWriter, ingest_bulk, ingest_manual,
};
pub use manuals::locate_pdf;
pub use normalize::{ExpansionRule, QueryNormalizer};
pub use search::{RetrievalEngine, make_boost};
pub use segment::Segmenter;
pub use types::{PassageRecord, SearchHit, SearchRequest};
