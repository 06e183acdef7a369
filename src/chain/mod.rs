//! Chain management: header skeleton, block import, validation, execution
//! and the event bus around them.

pub mod bloombits;
pub mod blockchain;
pub mod chain_makers;
pub mod events;
pub mod genesis;
pub mod header_chain;
pub mod processor;
pub mod validator;

pub use blockchain::{decode_exported, BlockChain};
pub use events::{ChainEvent, ChainFeeds, ChainHeadEvent, ChainSideEvent, NewMinedBlockEvent};
pub use genesis::{setup_genesis_block, Genesis};
pub use header_chain::{prefer_external, HeaderChain, WriteStatus};
pub use processor::{Executor, Processor, StateProcessor, TransferExecutor};
pub use validator::{calc_gas_limit, BlockValidator, ChainStateReader, Validator};
