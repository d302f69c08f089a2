pub mod assets;
pub mod browser;
pub mod bypass;
pub mod cache;
pub mod cli;
pub mod crawler;
pub mod error;
pub mod mirror;
pub mod proxy;
pub mod storage;
pub mod utils;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;
