use std::env;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ipnet::IpNet;
use podmesh_core::node::{NodeManager, Shutdown};
use podmesh_core::types::ConnectionInfo;
use podmesh_core::wg::{WireGuardController, WireGuardReconciler};
use wireguard_control::{Backend, InterfaceName, Key};

/// A self-organising WireGuard mesh node: brings up (or adopts) one WireGuard
/// interface, then gossips connection info with the peers it's told about until the
/// full mesh converges.
#[derive(Debug, Parser)]
#[clap(name = "podmesh", author, version, about)]
struct Opts {
    /// This node's name — the identity key of membership, distinct from its public key.
    name: String,

    /// This node's address on the overlay, as address/prefix (e.g. 10.97.0.1/24).
    overlay_cidr: IpNet,

    /// This node's WireGuard private key, base64-encoded.
    private_key: String,

    /// A transport network label this node sits on. Repeatable; order encodes
    /// preference when two peers share more than one network.
    #[clap(long = "network")]
    networks: Vec<String>,

    /// The WireGuard interface to create or adopt.
    #[clap(long, default_value = "wg-podmesh")]
    ifname: InterfaceName,

    /// The UDP port WireGuard listens on.
    #[clap(long, default_value_t = 51820)]
    port: u16,

    /// WireGuard backend to use. If not set, auto-selects based on availability.
    #[clap(long, default_value_t)]
    backend: Backend,

    /// Verbose output; repeat for more (-v debug, -vv trace).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logger(verbosity: u8) {
    if env::var_os("RUST_LOG").is_none() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        env::set_var("RUST_LOG", format!("warn,podmesh={level},podmesh_core={level}"));
    }
    pretty_env_logger::init();
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logger(opts.verbose);

    if opts.networks.is_empty() {
        anyhow::bail!("at least one --network label is required");
    }

    let private_key = Key::from_base64(&opts.private_key)?;

    let wg = WireGuardController::new(
        opts.overlay_cidr.clone(),
        opts.networks.clone(),
        private_key,
        opts.ifname.clone(),
        opts.port,
        opts.backend,
    )?;
    let public_key = wg.public_key().clone();
    log::info!("interface {} up, public key {}", opts.ifname, public_key.to_base64());

    let local_conn = ConnectionInfo {
        public_key,
        cidr: opts.overlay_cidr.clone(),
        networks: opts.networks,
        endpoints: Default::default(),
    };

    let manager = NodeManager::new(opts.name.clone(), local_conn, Arc::new(wg) as Arc<dyn WireGuardReconciler>);

    manager.on_connection_created.add_callback(|node| {
        log::info!("connected to peer '{}'", node.name);
    });
    manager.on_connection_lost.add_callback(|name| {
        log::info!("lost connection to peer '{name}'");
    });

    let shutdown = Shutdown::new();

    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("shutting down...");
            shutdown.request();
        })?;
    }

    let accept_handle = manager.spawn_accept_loop(shutdown.clone())?;
    let dial_handle = manager.spawn_dial_poll_loop(shutdown.clone());

    log::info!("podmesh node '{}' listening on {}:{}", opts.name, manager.overlay_addr(), podmesh_core::node::SERVER_PORT);

    while !shutdown.requested() {
        std::thread::sleep(Duration::from_millis(200));
    }

    accept_handle.join().ok();
    dial_handle.join().ok();

    Ok(())
}
