/// Blockchain communication module
/// Daemon JSON-RPC, the mining-port channel and block templates

pub mod node_channel;
pub mod rpc_client;
pub mod template;

pub use node_channel::{HashVerifier, NodeChannel, NodeError, NodeEvent};
pub use rpc_client::{DaemonApi, DaemonRpcClient, RpcError};
pub use template::BlockTemplate;
