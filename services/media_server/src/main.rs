mod configuration;
mod server;

use std::env::args;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use edgestream_core::accelerator::drpai::DrpaiProvider;
use edgestream_core::accelerator::AcceleratorCoordinator;
use edgestream_core::capture::v4l2::V4l2Provider;
use edgestream_core::capture::CaptureRegistry;
use edgestream_core::session::ServiceContext;
use log::{debug, info};

use crate::configuration::ServiceConfiguration;
use crate::server::MediaServer;

const DEFAULT_CONFIGURATION_PATH: &str = "assets/configuration.json";

fn main() -> Result<()> {
    env_logger::init();

    info!("┌───────────────────────────────────────────────────────┐");
    info!("│                Edgestream Media Server                │");
    info!("│ This program is licensed under the APACHE 2.0 license │");
    info!("│      For more information, see the LICENSE file       │");
    info!("│           (c) 2025 The Edgestream Developers          │");
    info!("└───────────────────────────────────────────────────────┘");
    info!("Edgestream core library version: {}", edgestream_core::version());

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        signal_shutdown.store(true, Ordering::Relaxed);
    })?;

    let project_dir = env!("CARGO_MANIFEST_DIR");
    let default_config_path = format!("{}/{}", project_dir, DEFAULT_CONFIGURATION_PATH);
    let conf_arg = args().nth(1).unwrap_or(default_config_path);
    info!("Configuration: {}", conf_arg);
    let conf = ServiceConfiguration::new(&conf_arg)?;
    debug!("Configuration: {:?}", conf);

    let capture = CaptureRegistry::new(V4l2Provider, conf.capture.clone());
    let accelerator = AcceleratorCoordinator::new(
        DrpaiProvider::new(&conf.accelerator.device),
        conf.accelerator.clone(),
    );
    info!(
        "Capture slots: {}, models root: {}",
        capture.capacity(),
        accelerator.models_root().display()
    );
    let ctx = ServiceContext::new(capture, accelerator, conf.session.clone());

    let mut server = MediaServer::bind(conf.listen.clone(), ctx)?;
    server.run(shutdown)?;
    info!("Media server stopped");
    Ok(())
}
