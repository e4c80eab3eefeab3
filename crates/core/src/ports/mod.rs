mod chain_client;
mod chain_indexer;
mod ledger_store;

pub use chain_client::*;
pub use chain_indexer::*;
pub use ledger_store::*;
