pub mod config;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod normalize;
pub mod output;
pub mod poller;
pub mod portal;
pub mod resolver;
pub mod schema;
pub mod storage;
pub mod submit;
pub mod transfer;
