pub mod config;
pub mod rate_limit;
pub mod source_url;
