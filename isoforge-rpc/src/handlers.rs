pub mod build_handler;

pub use build_handler::GenerateRequest;
