pub mod http_json;
pub mod mock_source;

pub use http_json::HttpJsonSource;
pub use mock_source::MockSource;
