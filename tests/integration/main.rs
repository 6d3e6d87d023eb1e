//! Integration tests: the full engine against an in-memory exchange.

mod mock_exchange;
mod scenarios;
