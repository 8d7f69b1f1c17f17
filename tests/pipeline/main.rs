#[path = "../support/mod.rs"]
mod support;

mod enrich_pipeline;
mod keepa_http;
mod runner;
