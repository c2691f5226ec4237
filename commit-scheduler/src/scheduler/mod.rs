/*!
Core modules of the commit scheduler daemon
*/

pub mod config;
pub mod control;
pub mod controller;
pub mod detection_engine;
pub mod event_system;
pub mod output_plugins;
pub mod state_manager;
