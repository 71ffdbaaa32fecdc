// src/ingest/providers/mod.rs
pub mod finnhub;
pub mod polygon;

pub use finnhub::FinnhubProvider;
pub use polygon::PolygonProvider;
