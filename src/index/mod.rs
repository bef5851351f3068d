pub mod block;
pub mod indexer;
pub mod merger;
