//! Lendscope API clients for external services.
//!
//! This crate provides HTTP clients for:
//! - DefiLlama: current USD prices, as a [`lendscope_chain::PriceFeed`]
//! - Morpho Blue API: markets and account positions, as a
//!   [`lendscope_chain::ChainDataSource`] for the Morpho adapter

mod defillama;
mod morpho;

pub use defillama::DefiLlamaClient;
pub use morpho::MorphoApiClient;
