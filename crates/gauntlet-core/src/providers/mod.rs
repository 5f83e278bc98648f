pub mod llm;
pub mod registry;

pub use registry::ProviderRegistry;
