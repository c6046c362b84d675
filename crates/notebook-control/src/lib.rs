pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod identity;
pub mod locks;
pub mod security;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
