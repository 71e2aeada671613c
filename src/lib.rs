pub mod analytics;
pub mod bulk_load;
pub mod config;
pub mod export_tree;
pub mod history_extract;
pub mod identity;
pub mod ingest;
pub mod overrides;
pub mod schema;
pub mod validate;
