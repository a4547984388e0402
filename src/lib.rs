//! Sharded, resumable history backfill.
//!
//! A conversation's ID span is cut into chunks ([`planner`]), drained by a
//! pool of workers that each own one remote session ([`engine`],
//! [`fetcher`]) and write into private shard files ([`frame`]). The shards
//! are then merged into one strictly ascending stream ([`merge`]) which is
//! committed through a probabilistic resume filter ([`resume`], [`sink`]).

pub mod config;
pub mod engine;
pub mod fetcher;
pub mod frame;
pub mod hotzone;
pub mod merge;
pub mod model;
pub mod planner;
pub mod queue;
pub mod resume;
pub mod sink;
pub mod state;
pub mod transport;

pub use config::BackfillConfig;
pub use engine::{merge_into, Engine, FetchReport};
pub use model::{ConversationSpan, IdRange, MessageRecord, RangeSet, RunStats};
pub use resume::ResumeFilter;
