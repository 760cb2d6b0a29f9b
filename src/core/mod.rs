//! QCODE engine
//!
//! ## Identifiers
//!
//! - [`category`] - Category values and their single-character codes
//! - [`scheme`] - Versioned identifier formats (v1 `ABAA-01`, v2 `AB20AA-01`)
//! - [`resolver`] - Used-identifier set and next free sequence
//! - [`generator`] - Identifier generation and first-time assignment
//! - [`slots`] - The eight derived-question slots under a parent
//!
//! ## Stores
//!
//! - [`record`] - Primary question record
//! - [`store`] - List, dict, slotted and tabular store adapters
//! - [`backup`] - Verified pre-mutation copies
//! - [`lock`] - One run at a time over a store set
//!
//! ## Keeping stores in agreement
//!
//! - [`consistency`] - Format checks, cross-store diffs, compliance reports
//! - [`mapping`] - Frozen old → new identifier mapping
//! - [`migration`] - Staged scheme migration with journal and report
//! - [`sync`] - Slotted parent entries and mirrored metadata
//! - [`config`] - TOML run configuration

pub mod backup;
pub mod category;
pub mod config;
pub mod consistency;
pub mod error;
pub mod generator;
pub mod journal;
pub mod lock;
pub mod mapping;
pub mod migration;
pub mod record;
pub mod resolver;
pub mod scheme;
pub mod slots;
pub mod store;
pub mod sync;
