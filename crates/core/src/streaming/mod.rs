//! Streaming support shared by every provider adapter: the tolerant
//! incremental JSON parser and the per-request aggregation context built on
//! top of it (spec §4.1 "Streaming").

pub mod context;
pub mod json_stream_parser;

pub use context::StreamingContext;
pub use json_stream_parser::JsonStreamParser;
