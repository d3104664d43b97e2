//! Tower layers for composing sink pipelines.

mod json;

pub use json::{JsonLayer, JsonService};
