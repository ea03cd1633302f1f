pub mod config;
pub mod engine;
pub mod event;
pub mod network;
pub mod plugin;
pub mod scene;

use plugin::input::{SharedKeyboard, UserInputPlugin};

/// Bootstraps a local participant with keyboard-driven navigation and runs a
/// few frames.
pub fn run() {
    let mut engine = engine::Engine::default();
    engine.add_plugin(UserInputPlugin::new(SharedKeyboard::new()));
    engine.run();
    engine.shutdown();
}
