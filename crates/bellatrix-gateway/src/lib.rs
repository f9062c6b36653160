pub mod connection;
pub mod dispatcher;
pub mod handlers;

pub use dispatcher::Dispatcher;
pub use handlers::GatewayContext;
