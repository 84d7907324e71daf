use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

use flowscribe::capture::{run_capture, CaptureSource, PcapFileCapture};
use flowscribe::config::Config;
use flowscribe::deframe::{DeframerConfig, Endian, LengthPrefixConfig, TypeField};
use flowscribe::flow::FlowManager;
use flowscribe::render::RendererRegistry;
use flowscribe::types::Direction;

#[derive(Parser)]
#[command(name = "flowscribe")]
#[command(author, version, about = "Reconstruct TCP conversations from packet captures")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the flows in a capture
    Flows {
        /// Capture file
        pcap: PathBuf,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Print every flow's messages as a transcript
    Messages {
        /// Capture file
        pcap: PathBuf,

        #[command(flatten)]
        session: SessionArgs,

        /// Only show flows involving this port
        #[arg(long)]
        flow_port: Option<u16>,
    },

    /// Print the default configuration
    DefaultConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DeframerKind {
    Raw,
    Http,
    Https,
    LengthPrefixed,
}

/// Options shared by the capture-reading commands
#[derive(clap::Args, Debug, Default)]
pub struct SessionArgs {
    /// Deframing strategy
    #[arg(long, value_enum)]
    deframer: Option<DeframerKind>,

    /// Length prefix width in bytes
    #[arg(long)]
    length_width: Option<usize>,

    /// Length prefix offset in bytes
    #[arg(long)]
    length_offset: Option<usize>,

    /// Big-endian length prefix
    #[arg(long)]
    big_endian: bool,

    /// Offset of the type discriminator
    #[arg(long)]
    type_offset: Option<usize>,

    /// Width of the type discriminator
    #[arg(long, default_value = "1")]
    type_width: usize,

    /// NSS key log for TLS flows
    #[arg(long)]
    key_log: Option<PathBuf>,

    /// Only track flows touching this port
    #[arg(short, long)]
    port: Option<u16>,
}

impl SessionArgs {
    /// Fold command line options over the loaded configuration
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.capture.target_port = Some(port);
        }
        if let Some(path) = &self.key_log {
            config.capture.key_log_file = Some(path.clone());
        }

        let kind = match self.deframer {
            Some(kind) => kind,
            None if self.length_width.is_some()
                || self.length_offset.is_some()
                || self.type_offset.is_some() =>
            {
                DeframerKind::LengthPrefixed
            }
            None => return,
        };
        config.deframer = match kind {
            DeframerKind::Raw => DeframerConfig::Raw,
            DeframerKind::Http => DeframerConfig::Http,
            DeframerKind::Https => DeframerConfig::HttpsWithKeyLog { key_log_path: None },
            DeframerKind::LengthPrefixed => {
                let mut lp = match &config.deframer {
                    DeframerConfig::LengthPrefixed(existing) => existing.clone(),
                    _ => LengthPrefixConfig::default(),
                };
                if let Some(width) = self.length_width {
                    lp.length_width = width;
                }
                if let Some(offset) = self.length_offset {
                    lp.length_offset = offset;
                }
                if self.big_endian {
                    lp.endian = Endian::Big;
                }
                if let Some(offset) = self.type_offset {
                    lp.type_field = Some(TypeField {
                        offset,
                        width: self.type_width,
                    });
                }
                DeframerConfig::LengthPrefixed(lp)
            }
        };
    }
}

/// Table row for flow list
#[derive(Tabled)]
struct FlowRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Reference")]
    reference: String,
    #[tabled(rename = "Peer")]
    peer: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Pkts out/in")]
    packets: String,
    #[tabled(rename = "Bytes out/in")]
    bytes: String,
    #[tabled(rename = "Messages")]
    messages: usize,
    #[tabled(rename = "Deframer")]
    deframer: String,
}

pub fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    match cli.command {
        Commands::Flows { pcap, session } => {
            session.apply(&mut config);
            let manager = replay(&config, &pcap)?;
            print_flows(&manager);
        }

        Commands::Messages {
            pcap,
            session,
            flow_port,
        } => {
            session.apply(&mut config);
            let manager = replay(&config, &pcap)?;
            print_transcript(&manager, flow_port);
        }

        Commands::DefaultConfig => {
            print!("{}", Config::default_with_comments());
        }
    }

    Ok(())
}

/// Replay a capture file through a manager built from `config`
fn replay(config: &Config, pcap: &Path) -> Result<FlowManager> {
    config.validate()?;
    let manager = config.build_manager()?;

    let mut capture = PcapFileCapture::open(pcap)?;
    if let Some(link) = config.capture.link_type {
        capture = capture.with_link_type(link);
    }
    run_capture(&mut capture, &manager)
        .with_context(|| format!("Failed to replay {}", pcap.display()))?;

    let stats = capture.stats();
    if stats.undecodable > 0 {
        eprintln!(
            "{}",
            format!("{} of {} frames could not be decoded", stats.undecodable, stats.received)
                .yellow()
        );
    }
    Ok(manager)
}

fn print_flows(manager: &FlowManager) {
    let rows: Vec<FlowRow> = manager
        .flows()
        .iter()
        .map(|flow| {
            let summary = flow.summary();
            let key = summary.key;
            let peer = if *key.low() == summary.reference {
                key.high()
            } else {
                key.low()
            };
            FlowRow {
                id: summary.id,
                reference: summary.reference.to_string(),
                peer: peer.to_string(),
                status: summary.status.to_string(),
                packets: format!("{}/{}", summary.packets[0], summary.packets[1]),
                bytes: format!("{}/{}", summary.bytes[0], summary.bytes[1]),
                messages: summary.messages,
                deframer: summary.deframer.to_string(),
            }
        })
        .collect();

    if rows.is_empty() {
        println!("No flows found");
        return;
    }
    println!("{}", Table::new(rows));

    let stats = manager.stats();
    println!(
        "{} packets, {} flows, {} messages, {} malformed, {} ignored",
        stats.packets_processed,
        stats.flows_created,
        stats.messages_emitted,
        stats.packets_malformed,
        stats.packets_ignored
    );
}

fn print_transcript(manager: &FlowManager, port: Option<u16>) {
    let registry = RendererRegistry::new();

    for flow in manager.flows() {
        if let Some(port) = port {
            if !flow.key().involves_port(port) {
                continue;
            }
        }

        let summary = flow.summary();
        let mut header = format!("Flow {} {} [{}]", summary.id, summary.key, summary.status);
        if let Some(process) = &summary.process {
            header.push_str(&format!(" {}", process));
        }
        println!("{}", header.bold());
        if !summary.decryptable {
            println!("{}", "  not decryptable: key material missing".red());
        }

        for message in flow.messages().iter() {
            let label = format!(
                "#{} {} {} +{}ms {} bytes",
                message.index,
                message.direction,
                message.timestamp.format("%H:%M:%S%.3f"),
                message.interval.as_millis(),
                message.len()
            );
            let body = registry.render(message);
            match message.direction {
                Direction::Outgoing => {
                    println!("{}", label.cyan());
                    print_indented(&body, 2);
                }
                Direction::Incoming => {
                    println!("{}", format!("{:>60}", label).green());
                    print_indented(&body, 8);
                }
            }
        }

        for diagnostic in flow.diagnostics() {
            println!("{}", format!("  ! {}", diagnostic).yellow());
        }
        println!();
    }
}

fn print_indented(body: &str, indent: usize) {
    for line in body.lines() {
        println!("{:indent$}{}", "", line, indent = indent);
    }
}
