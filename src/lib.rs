pub mod cli;
pub mod compiler;
pub mod context;
pub mod live;
pub mod paths;
pub mod port;
pub mod preflight;
pub mod proxy;
pub mod server;
pub mod urls;
