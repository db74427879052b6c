//! Pagedrop
//!
//! Preview/publish service for static web bundles. Clients upload a bundle
//! of files, receive an ephemeral preview URL, and can later promote that
//! preview into a permanent, publicly addressable artifact. Requests pass
//! through an admission layer (per-IP sliding window, global token bucket,
//! per-user single-flight lock) backed by Redis; content lives in an
//! S3-compatible object store, metadata in a PostgreSQL ledger.
//!
//! ## Architecture
//!
//! ```text
//! Client                      Redis                      Object store
//! ┌──────────────┐           ┌──────────────┐           ┌─────────────────┐
//! │ POST         │           │ rl:sw:*      │           │ preview/{id}/   │
//! │ /preview     │──────────▶│ rl:tb:*      │           │   content/*     │
//! │ /publish     │  guards   │ user-conc:*  │           │ public/{id}/    │
//! └──────────────┘           └──────────────┘           │   content/*     │
//!        │                                              │ covers/{id}.*   │
//!        ▼                                              └─────────────────┘
//! ┌──────────────┐                                             ▲
//! │ Admission    │                                             │ upload /
//! └──────────────┘                                             │ prefix copy
//!        │                                                     │
//!        ▼                                                     │
//! ┌──────────────┐    insert/link rows     ┌──────────────┐    │
//! │ Preview /    │────────────────────────▶│ PostgreSQL   │    │
//! │ Publish      │                         │ previews     │    │
//! │ services     │─────────────────────────│ artifacts    │────┘
//! └──────────────┘                         └──────────────┘
//! ```
//!
//! The edge serving worker (separate deployment) reads the `preview/` and
//! `public/` prefixes; it never writes.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod kv;
pub mod ledger;
pub mod object_store;
pub mod paths;
pub mod preview;
pub mod publish;

pub use admission::{Admission, Identity};
pub use api::AppState;
pub use config::Config;
pub use error::AppError;
pub use kv::KvStore;
pub use ledger::{Artifact, Ledger, Preview};
pub use object_store::ObjectStore;
pub use preview::{FileEntry, PreviewCreated, PreviewService};
pub use publish::{PublishRequest, PublishService};
