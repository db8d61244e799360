//! Process startup helpers shared by the binary and integration tests

mod config;
mod node;

pub use config::load_config;
pub use node::generate_node_id;
