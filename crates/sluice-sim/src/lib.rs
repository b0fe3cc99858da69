//! Deterministic scenario harness for the SLUICE fetcher: scripted sinks,
//! synthetic items, and fetchers wired to in-memory capabilities.

pub mod scenarios;
