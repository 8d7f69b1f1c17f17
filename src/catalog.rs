//! Catalog data model and the batch splitter that partitions line items into
//! fixed-size, stably-identified batches for enrichment.

pub mod item;
pub mod splitter;
