//! Integration tests: the fetch layer and the ingest → consensus
//! pipeline against a local mock bookmaker over real sockets.

mod fetch_client;
mod mock_book;
mod pipeline;
