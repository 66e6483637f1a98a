//! Plugins bundled with the gateway.

pub mod bulletin;
pub mod core_plugin;

use std::sync::Arc;

use super::{Plugin, PluginRegistry};

fn make_core() -> Arc<dyn Plugin> {
    Arc::new(core_plugin::CorePlugin::new())
}

fn make_bulletin() -> Arc<dyn Plugin> {
    Arc::new(bulletin::BulletinPlugin::new())
}

/// Add every bundled plugin factory to `registry`.
pub fn register_all(registry: &mut PluginRegistry) {
    let bundled: [(&str, fn() -> Arc<dyn Plugin>); 2] =
        [("core", make_core), ("bulletin", make_bulletin)];
    for (name, factory) in bundled {
        if let Err(e) = registry.register(name, factory) {
            log::error!("Bundled plugin {} not registered: {}", name, e);
        }
    }
}
