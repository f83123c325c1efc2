//! ccsd main entry point
//!
//! Starts the camera control server with the simulated controller; the
//! native driver is attached at the same seam when real hardware is
//! present.

use std::env;
use std::process;
use std::sync::Arc;

use ccsd_lib::config::load_config;
use ccsd_lib::hardware::{HardwareHandle, SimCcd};
use ccsd_lib::listener::Server;
use log::info;

fn main() {
    // Initialize logging
    env_logger::init();

    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "ccsd.json".to_string());

    println!("ccsd starting...");
    println!("Loading configuration from: {}", config_path);

    // Load configuration
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    println!("Listening on: {}", config.listen_addr);
    println!(
        "Peers: telescope {} / pipeline {}",
        config.telescope_addr, config.pipeline_addr
    );

    // Attach the controller
    let (driver, abort) = SimCcd::new();
    let hardware = HardwareHandle::new(Box::new(driver), abort);

    // Create the server
    let server = match Server::new(config, hardware) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            eprintln!("Error creating server: {}", e);
            process::exit(1);
        }
    };

    // Shut down cleanly on SIGINT
    {
        let server = server.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown requested");
            server.stop();
        }) {
            eprintln!("Error installing signal handler: {}", e);
            process::exit(1);
        }
    }

    println!("ccsd initialized, entering accept loop...");

    // Run main loop
    if let Err(e) = server.run() {
        eprintln!("Error in main loop: {}", e);
        process::exit(1);
    }

    println!("ccsd shutdown complete");
}
