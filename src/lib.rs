// Library surface for the binary and the integration tests.
pub mod app_dirs;
pub mod audio;
pub mod config;
pub mod controller;
pub mod devices;
pub mod dispatch;
pub mod escalation;
pub mod extension;
pub mod fusion;
pub mod monitor;
pub mod rest;
pub mod rig;
pub mod round;
pub mod runtime;
pub mod safety;
pub mod session;
pub mod sim;
