pub mod config;
pub mod digest;
pub mod error;
pub mod export;
pub mod ledger;
pub mod pipeline;
pub mod retry;
pub mod runtime;
pub mod upload;
pub mod wiki;
pub mod wikitext;

#[cfg(test)]
mod testing;
