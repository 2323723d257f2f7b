//! Lendscope chain data layer.
//!
//! This crate provides:
//! - The common market/position schema shared by every protocol
//! - Protocol adapters for Aave V3, Morpho Blue, Compound III and Moonwell
//! - The [`ChainDataSource`] capability adapters read from
//! - Price lookup with staleness enforcement ([`PriceBook`])
//! - Bounded, cancellable fan-out across adapters ([`AdapterSet`])
//! - Fixed-point helpers for protocol-native encodings

mod cancel;
pub mod math;
pub mod oracle;
pub mod protocol;

pub use cancel::{CancelHandle, CancelSignal};
pub use oracle::{PriceBook, PriceError, PriceFeed, PriceLookup, PriceQuote};
pub use protocol::{
    AdapterSet, Asset, ChainDataSource, EntryFailure, FetchBatch, FetchConfig, MarketId,
    MarketParams, Position, PositionKey, Protocol, ProtocolAdapter, ProtocolSweep, RawAccount,
    RawMarket, SourceError,
};
