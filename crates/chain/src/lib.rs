pub mod abi;
pub mod address;
pub mod decoder;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod provider;
pub mod source;

pub use abi::ContractAbis;
pub use alloy::json_abi::JsonAbi;
pub use alloy::primitives::{Address, U256};
pub use provider::AlloySource;
pub use source::{
    ChainError, ChainSource, EventStream, PresaleState, RawEvent, RawRow, SliceResult,
};
