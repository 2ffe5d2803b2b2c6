use std::{net::IpAddr, path::PathBuf, time::Duration};

use clap::Parser;
use uuid::Uuid;
use wg_warden::{
    Error, Reconciler, Settings,
    alloc::AddressPool,
    reconciler::PeerView,
    settings::{DEFAULT_KEEPALIVE, DEFAULT_ONLINE_WINDOW},
    store::{PeerStore, now_epoch_secs},
    wg::{Cidr, Endpoint, Key, List, WireguardApi, cmd::WgCmdBackend},
};

#[derive(Debug, clap::Parser)]
#[command(version, about = "Manage WireGuard peers and their client profiles")]
pub struct Args {
    #[arg(long, env = "WG_INTERFACE", default_value = "wg0")]
    iface: String,

    /// Read from the interface when not given.
    #[arg(long, env = "WG_SERVER_PUBLIC_KEY")]
    server_public_key: Option<Key>,

    #[arg(long, env = "WG_SERVER_ENDPOINT", default_value = "vpn.example.com:51820")]
    server_endpoint: Endpoint,

    #[arg(long, env = "WG_DNS", default_value = "1.1.1.1, 1.0.0.1")]
    dns: List<IpAddr>,

    /// Routes pushed to clients.
    #[arg(long, env = "WG_ALLOWED_IPS", default_value = "0.0.0.0/0, ::/0")]
    allowed_ips: List<Cidr>,

    #[arg(long, env = "WG_SUBNET", default_value = "10.10.0.0/24")]
    subnet: Cidr,

    #[arg(long, env = "WG_START_IP", default_value_t = 10)]
    start_ip: u8,

    #[arg(long, env = "WG_KEEPALIVE", default_value_t = DEFAULT_KEEPALIVE)]
    keepalive: u32,

    /// Seconds since the last handshake for a peer to count as online.
    #[arg(long, env = "WG_ONLINE_WINDOW", default_value_t = DEFAULT_ONLINE_WINDOW.as_secs())]
    online_window: u64,

    /// Seconds before a wg invocation is abandoned.
    #[arg(long, env = "WG_COMMAND_TIMEOUT", default_value_t = 5)]
    command_timeout: u64,

    /// Persist the live table with `wg-quick save` after every change.
    #[arg(long, env = "WG_SAVE_CONFIG")]
    save_config: bool,

    #[arg(long, env = "DATABASE_PATH", default_value = "wireguard_peers.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create a peer and print its profile.
    Create {
        #[arg(long)]
        name: Option<String>,

        /// Also generate a preshared key.
        #[arg(long)]
        psk: bool,
    },
    Delete {
        id: Uuid,
    },
    Toggle {
        id: Uuid,
    },
    Enable {
        id: Uuid,
    },
    Disable {
        id: Uuid,
    },
    List,
    /// Print one peer and its profile.
    Show {
        id: Uuid,
    },
    Stats,
    ResetCounters {
        id: Uuid,
    },
    /// Bring the live table in line with the store.
    Reconcile,
    /// Reconcile now and then every `interval` seconds, refreshing counters.
    Watch {
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },
}

impl Args {
    fn settings(&self) -> Result<Settings, Error> {
        let pool = AddressPool::new(self.subnet, self.start_ip)?;
        let mut settings = Settings::new(
            self.iface.clone(),
            pool,
            self.server_public_key.unwrap_or_default(),
            self.server_endpoint.clone(),
        );
        settings.dns = self.dns.0.clone();
        settings.allowed_ips = self.allowed_ips.0.clone();
        settings.persistent_keepalive = (self.keepalive > 0).then_some(self.keepalive);
        settings.online_window = Duration::from_secs(self.online_window);
        settings.command_timeout = Duration::from_secs(self.command_timeout);
        settings.save_config = self.save_config;

        Ok(settings)
    }
}

impl Command {
    fn renders_profile(&self) -> bool {
        matches!(self, Command::Create { .. } | Command::Show { .. })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let renders_profile = args.command.renders_profile();
    let mut settings = args.settings()?;

    let wg = WgCmdBackend::new(settings.command_timeout);

    if args.server_public_key.is_none() {
        match wg.get_pub_key(&settings.interface).await {
            Ok(key) => settings.server_public_key = key,
            Err(err) if !renders_profile => log::warn!("server public key unknown: {err}"),
            Err(err) => return Err(err),
        }
    }

    let store = PeerStore::open(&args.database)?;
    let reconciler = Reconciler::new(store, wg, settings);

    match args.command {
        Command::Create { name, psk } => {
            let created = reconciler.create_peer(name.as_deref(), psk).await?;
            println!("# {} {} {}", created.peer.id, created.peer.name, created.peer.address);
            println!("{}", created.profile);
        }

        Command::Delete { id } => {
            let peer = reconciler.delete_peer(id).await?;
            println!("deleted {} ({})", peer.name, peer.address);
        }

        Command::Toggle { id } => {
            let peer = reconciler.toggle_peer(id).await?;
            println!("{} {}", peer.name, status(peer.enabled));
        }

        Command::Enable { id } => {
            let peer = reconciler.set_peer_enabled(id, true).await?;
            println!("{} {}", peer.name, status(peer.enabled));
        }

        Command::Disable { id } => {
            let peer = reconciler.set_peer_enabled(id, false).await?;
            println!("{} {}", peer.name, status(peer.enabled));
        }

        Command::List => {
            let now = now_epoch_secs();
            for view in reconciler.list_peers().await? {
                print_view(&view, now);
            }
        }

        Command::Show { id } => {
            let details = reconciler.get_peer(id).await?;
            print_view(&details.view, now_epoch_secs());
            println!();
            println!("{}", details.profile);
        }

        Command::Stats => {
            let summary = reconciler.summary().await?;
            let now = now_epoch_secs();
            println!(
                "{} peers, {} enabled, {} online",
                summary.total,
                summary.enabled,
                summary.online.len()
            );
            for view in &summary.online {
                print_view(view, now);
            }
        }

        Command::ResetCounters { id } => {
            reconciler.reset_counters(id).await?;
            println!("counters reset");
        }

        Command::Reconcile => {
            let report = reconciler.reconcile().await?;
            println!(
                "{} added, {} removed, {} failed",
                report.added, report.removed, report.failed
            );
        }

        Command::Watch { interval } => {
            if let Err(err) = reconciler.reconcile().await {
                log::error!("startup reconcile failed: {err}");
            }

            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = reconciler.reconcile().await {
                            log::warn!("reconcile failed: {err}");
                        }
                        if let Err(err) = reconciler.list_peers().await {
                            log::error!("counter refresh failed: {err}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("interrupted, exiting");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

fn status(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

fn print_view(view: &PeerView, now: i64) {
    let state = match (view.enabled, view.live, view.online) {
        (false, ..) => "disabled",
        (true, false, _) => "unknown",
        (true, true, true) => "online",
        (true, true, false) => "offline",
    };

    println!(
        "{}  {:<24} {:<15} {:<8} rx {:>10} tx {:>10} total {:>10}  {}",
        view.id,
        view.name,
        view.address,
        state,
        format_bytes(view.rx_bytes),
        format_bytes(view.tx_bytes),
        format_bytes(view.total_rx + view.total_tx),
        time_ago(view.last_handshake, now),
    );
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let b = bytes as f64;

    if b < KB {
        format!("{bytes} B")
    } else if b < KB * KB {
        format!("{:.1} KB", b / KB)
    } else if b < KB * KB * KB {
        format!("{:.1} MB", b / (KB * KB))
    } else {
        format!("{:.2} GB", b / (KB * KB * KB))
    }
}

fn time_ago(ts: Option<i64>, now: i64) -> String {
    let Some(ts) = ts else {
        return "never".to_string();
    };

    match (now - ts).max(0) {
        s if s < 60 => "just now".to_string(),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86400),
    }
}
