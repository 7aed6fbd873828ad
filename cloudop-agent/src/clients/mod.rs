//! Provider and extension clients used by the agent

pub mod arm;
pub mod extension;

pub use arm::ArmClient;
pub use extension::HttpExtension;
