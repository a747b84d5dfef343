//! rovpn Client Binary
//!
//! Connects to an OpenVPN server using a TOML client profile. Decrypted
//! packets are counted and dropped; plugging in a TUN device is left to
//! embedders of the library.

use log::{debug, error, info, warn};
use rovpn::{
    client::VpnClient,
    config::ClientProfile,
    error::{Result, VpnError},
    tunnel::socket::ChannelTunnel,
};
use std::env;
use std::process;
use tokio::signal;

fn usage() -> ! {
    eprintln!("Usage: rovpn-client <profile.toml> [--check]");
    process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let check_only = args.iter().any(|a| a == "--check");
    let Some(profile_path) = args.iter().find(|a| !a.starts_with("--")) else {
        usage();
    };

    let profile = match ClientProfile::from_file(profile_path) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("Failed to load {profile_path}: {e}");
            process::exit(1);
        }
    };

    // RUST_LOG wins over the profile
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(profile.logging.level.as_str()),
    )
    .init();

    info!("Starting rovpn client v{}", env!("CARGO_PKG_VERSION"));
    profile.validate()?;
    info!("Loaded profile from: {profile_path}");

    if check_only {
        return check(&profile);
    }

    let mut client = VpnClient::new(profile)?;
    let (tunnel, mut packets) = ChannelTunnel::new(true);
    client.set_tunnel(Box::new(tunnel));

    tokio::spawn(async move {
        let mut received = 0u64;
        while let Some(batch) = packets.recv().await {
            received += batch.len() as u64;
            debug!("Received {} packet(s), {received} total", batch.len());
        }
    });

    let handle = client.handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                if let Err(e) = handle.shutdown() {
                    warn!("Shutdown failed: {e}");
                }
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
        }
    });

    info!("VPN client is running. Press Ctrl+C to disconnect.");
    match client.run().await {
        Ok(()) => {
            info!("VPN client stopped");
            Ok(())
        }
        Err(e) => {
            error!("VPN client failed: {e}");
            Err(e)
        }
    }
}

fn check(profile: &ClientProfile) -> Result<()> {
    let parsed = profile.load_session()?;
    if let Some(warning) = &parsed.warning {
        warn!("{warning}");
    }
    if parsed.endpoints.is_empty() {
        return Err(VpnError::Config("Profile has no remote".into()));
    }

    let configuration = &parsed.configuration;
    println!("Profile: {}", profile.ovpn_path().display());
    for endpoint in &parsed.endpoints {
        println!(
            "  remote {}:{} ({})",
            endpoint.hostname, endpoint.port, endpoint.socket_type
        );
    }
    println!("  cipher {:?}, auth {:?}", configuration.cipher, configuration.digest);
    println!(
        "  compression {:?}/{:?}",
        configuration.compression_framing, configuration.compression_algorithm
    );
    println!("  tls wrap: {}", configuration.tls_wrap.is_some());
    if let Some(interval) = configuration.keep_alive_interval {
        println!("  keep-alive every {}s", interval.as_secs());
    }
    if let Some(after) = configuration.renegotiates_after {
        println!("  renegotiate after {}s", after.as_secs());
    }
    println!(
        "  credentials: {}",
        if profile.credentials().is_some() {
            "yes"
        } else {
            "no"
        }
    );
    Ok(())
}
