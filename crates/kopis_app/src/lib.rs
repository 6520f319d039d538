pub mod audit;
pub mod engine;
pub mod logging;
pub mod recovery;
pub mod session;
