pub mod codec;
pub mod config;
pub mod dispatch;
pub mod display;
pub mod gate;
pub mod motor;
pub mod runtime;
pub mod safety;
pub mod transport;
