//! This mod is meant to hold most of the code for the library's client-facing API.
mod node;
mod options;
mod types;
mod wiring;

pub use node::DirectoryNode;
pub use node::DirectoryWriteError;
pub use options::RaftOptions;
pub use types::CampaignResult;
pub use types::MemberInfo;
pub use types::WriteOutput;
pub use wiring::try_create_directory_node;
pub use wiring::DirectoryNodeConfig;
pub use wiring::NodeCreationError;
