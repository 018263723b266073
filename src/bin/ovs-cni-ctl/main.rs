use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ovs_cni::config::{IPAMConfig, Installer, NetConf, PluginConfig, DEFAULT_SOCKET_FILE};
use ovs_cni::integrations::cache::{CacheStore, FileCache};
use ovs_cni::integrations::ovsdb::OvsdbClient;
use ovs_cni::plugin::sweep::clean_ports;
use ovs_cni::vlan::{split_vlan_ids, Trunk};

/// Operator tool for the OVS CNI plugin
#[derive(Parser)]
#[command(name = "ovs-cni-ctl", author, version, about)]
struct Cli {
    /// Directory holding cached attachment records
    #[arg(long, env = "OVS_CNI_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a network configuration
    Generate {
        /// Network name
        #[arg(long, default_value = "ovs-network")]
        name: String,

        /// Bridge to attach to
        #[arg(long)]
        bridge: String,

        /// Access VLAN tag (0-4095)
        #[arg(long, conflicts_with = "trunk")]
        vlan: Option<u32>,

        /// Trunk VLANs, e.g. "10-20,42"
        #[arg(long)]
        trunk: Option<String>,

        /// Interface MTU
        #[arg(long)]
        mtu: Option<u32>,

        /// IPAM subnet (CIDR notation), uses host-local
        #[arg(long)]
        subnet: Option<String>,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Create the CNI directories and a default network list
    Install {
        /// Bridge used by the default network
        #[arg(long, default_value = "br0")]
        bridge: String,

        #[arg(long, default_value = "/opt/cni/bin")]
        bin_dir: PathBuf,

        #[arg(long, default_value = "/etc/cni/net.d")]
        conf_dir: PathBuf,
    },

    /// Inspect or remove cached attachment records
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Remove ports whose interfaces are in error state
    Sweep {
        /// Bridge the ports are removed from
        #[arg(long)]
        bridge: String,

        /// OVSDB endpoint
        #[arg(long, default_value = DEFAULT_SOCKET_FILE)]
        socket: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached records
    List,
    /// Print one record
    Show { key: String },
    /// Delete one record
    Purge { key: String },
}

/// Parse "10-20,42" into trunk entries.
fn parse_trunks(spec: &str) -> Result<Vec<Trunk>> {
    let mut trunks = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let trunk = match part.split_once('-') {
            Some((min, max)) => Trunk::range(
                min.trim().parse().with_context(|| format!("invalid trunk {:?}", part))?,
                max.trim().parse().with_context(|| format!("invalid trunk {:?}", part))?,
            ),
            None => Trunk::single(part.parse().with_context(|| format!("invalid trunk {:?}", part))?),
        };
        trunks.push(trunk);
    }
    split_vlan_ids(&trunks)?;
    Ok(trunks)
}

fn generate_network_config(
    name: &str,
    bridge: &str,
    vlan: Option<u32>,
    trunk: Option<&str>,
    mtu: Option<u32>,
    subnet: Option<&str>,
) -> Result<NetConf> {
    if vlan.is_some_and(|v| v > 4095) {
        bail!("VLAN tag must be between 0 and 4095");
    }
    let mut conf = NetConf::new_default(name, bridge, vlan, mtu);
    if let Some(trunk) = trunk {
        conf.trunk = parse_trunks(trunk)?;
    }
    if let Some(subnet) = subnet {
        let mut extra = serde_json::Map::new();
        extra.insert("subnet".into(), serde_json::Value::from(subnet));
        conf.ipam = Some(IPAMConfig {
            ipam_type: "host-local".to_string(),
            extra,
        });
    }
    Ok(conf)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    let mut plugin_config = PluginConfig::default();
    if let Some(dir) = cli.cache_dir {
        plugin_config.cache_dir = dir;
    }

    match cli.command {
        Commands::Generate { name, bridge, vlan, trunk, mtu, subnet, output } => {
            let conf = generate_network_config(
                &name,
                &bridge,
                vlan,
                trunk.as_deref(),
                mtu,
                subnet.as_deref(),
            )?;
            match output {
                Some(path) => {
                    conf.save(path.clone())?;
                    println!("Network configuration written to {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&conf)?),
            }
        }

        Commands::Install { bridge, bin_dir, conf_dir } => {
            plugin_config.cni_bin_dir = bin_dir;
            plugin_config.cni_conf_dir = conf_dir;
            let path = Installer::new(plugin_config).install(&bridge)?;
            println!("Network list written to {}", path.display());
        }

        Commands::Cache { action } => {
            let cache = FileCache::new(&plugin_config.cache_dir);
            match action {
                CacheAction::List => {
                    let keys = cache.list()?;
                    if keys.is_empty() {
                        println!("No cached attachments in {}", plugin_config.cache_dir.display());
                    }
                    for key in keys {
                        match cache.load(&key) {
                            Ok(Some(record)) => println!(
                                "{}  bridge={} deviceID={} userspace={}",
                                key,
                                record.netconf.br_name,
                                record.netconf.device_id,
                                record.userspace_mode
                            ),
                            Ok(None) => {}
                            Err(err) => println!("{}  unreadable: {:#}", key, err),
                        }
                    }
                }
                CacheAction::Show { key } => {
                    let record = cache
                        .load(&key)?
                        .with_context(|| format!("no cached attachment {}", key))?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }
                CacheAction::Purge { key } => {
                    cache.delete(&key)?;
                    info!(key = %key, "purged cached attachment");
                }
            }
        }

        Commands::Sweep { bridge, socket } => {
            let client = OvsdbClient::new(&socket)?;
            let report = clean_ports(&client, &bridge);
            for port in &report.removed {
                println!("removed {}", port);
            }
            for port in &report.failed {
                println!("failed {}", port);
            }
            if report.removed.is_empty() && report.failed.is_empty() {
                println!("No interfaces in error state");
            }
        }
    }

    Ok(())
}
