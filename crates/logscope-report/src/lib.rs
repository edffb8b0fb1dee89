//! Report rendering for logscope.
//!
//! Analyses assemble a [`Report`] document; [`render`] turns it into plain
//! text, markdown or JSON. The table helpers convert aggregations and join
//! results into [`Table`] blocks.

pub mod document;
pub mod render;
pub mod tables;

pub use document::{Align, Block, Report, Section, Table};
pub use render::{render, render_table, render_to, Format};
pub use tables::{bucket_table, distribution_table, join_table, BucketColumns, JoinColumns};
