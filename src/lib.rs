pub mod annotation;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod index;
pub mod output;
pub mod palette;
pub mod search;
pub mod selection;
pub mod session;
pub mod store;
pub mod tabular;
pub mod volcano;
