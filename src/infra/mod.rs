pub mod gguf;
pub mod llama;
pub mod storage;
pub mod system;

pub use gguf::GgufHeader;
pub use llama::GgufBackend;
pub use storage::DirectorySource;
pub use system::SystemProbe;
