pub mod parsing;

pub use parsing::resolve_stream_url;
