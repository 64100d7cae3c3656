pub mod rpc;
pub mod signer;

pub use rpc::{ChainClient, ChainConnector, EthersChainClient, EthersConnector};
pub use signer::{TxSigner, WalletSigner};
