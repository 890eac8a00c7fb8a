/// Request handling for the document API.
///
/// [`Dispatcher`] holds the transport-independent routing rules; [`http`]
/// adapts it to axum.
pub mod dispatcher;
pub mod http;

pub use dispatcher::{ApiRequest, ApiResponse, Dispatcher, Method};
