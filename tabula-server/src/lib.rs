pub mod http;
pub mod locks;
pub mod pipeline;
pub mod repo;
pub mod upstream;
