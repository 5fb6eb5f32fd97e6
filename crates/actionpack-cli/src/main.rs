//! actionpack: sender CLI for the action pack system.
//!
//! Authors packs from scripts, signs them with a locally stored P-256
//! key, and delivers them to receivers over TCP. Also carries the
//! receiver-side `receiver enable` installer so pairing is one copy-paste.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;
mod store;

/// Default TTL for freshly compiled packs: 5 minutes.
const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

/// actionpack - signed remote execution for trusted peers
#[derive(Parser, Debug)]
#[command(name = "actionpack")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ensure a signing key exists; print its public key
    Keygen {
        /// Key identifier
        #[arg(long, default_value = "default")]
        id: String,
    },

    /// Print the public key of an existing signing key
    #[command(name = "export-pub")]
    ExportPub {
        /// Key identifier
        #[arg(long, default_value = "default")]
        id: String,
    },

    /// Compile and sign a script; write the envelope to a file
    Pack {
        /// Script path
        script: PathBuf,

        /// Output envelope path
        #[arg(long)]
        out: PathBuf,

        /// Key identifier
        #[arg(long, default_value = "default")]
        id: String,

        /// Pack time-to-live in milliseconds (0 = no expiry)
        #[arg(long = "ttl-ms", default_value_t = DEFAULT_TTL_MS)]
        ttl_ms: u64,
    },

    /// Compile, sign, and deliver a script; print the transcript
    Run {
        /// Script path
        script: PathBuf,

        /// Receiver name or ip:port
        #[arg(long)]
        to: String,

        /// Key identifier
        #[arg(long, default_value = "default")]
        id: String,

        /// Pack time-to-live in milliseconds (0 = no expiry)
        #[arg(long = "ttl-ms", default_value_t = DEFAULT_TTL_MS)]
        ttl_ms: u64,
    },

    /// Deliver a prebuilt envelope; print the transcript
    Send {
        /// Receiver name or ip:port
        #[arg(long)]
        to: String,

        /// Envelope path
        file: PathBuf,
    },

    /// Upsert a receiver into the local directory
    Register {
        /// Receiver name
        name: String,

        /// Receiver address (ip:port)
        addr: String,
    },

    /// List the receiver directory
    Receivers,

    /// Generate a key, register the receiver, and print the enablement
    /// command (optionally running it over tailscale ssh)
    Pair {
        /// Receiver name
        name: String,

        /// Receiver address (ip:port)
        addr: String,

        /// Key identifier
        #[arg(long, default_value = "default")]
        id: String,

        /// Run the enablement command on this tailscale host
        #[arg(long)]
        ssh: Option<String>,
    },

    /// Receiver-side management
    #[command(subcommand)]
    Receiver(ReceiverCommands),
}

#[derive(Subcommand, Debug)]
enum ReceiverCommands {
    /// Trust a sender key and write the receiver configuration
    Enable {
        /// Listen address for the daemon (ip:port; ":port" for all
        /// interfaces)
        #[arg(long)]
        listen: String,

        /// Key id and base64 public key to trust
        #[arg(long, num_args = 2, value_names = ["KEY_ID", "PUBKEY"])]
        trust: Vec<String>,

        /// Sandbox root for writes and relative commands
        #[arg(long, default_value = "/tmp")]
        root: String,
    },
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Keygen { id } => commands::keys::keygen(&id)?,
        Commands::ExportPub { id } => commands::keys::export_pub(&id)?,
        Commands::Pack {
            script,
            out,
            id,
            ttl_ms,
        } => return commands::pack::pack(&script, &out, &id, ttl_ms),
        Commands::Run {
            script,
            to,
            id,
            ttl_ms,
        } => return commands::pack::run(&script, &to, &id, ttl_ms),
        Commands::Send { to, file } => return commands::pack::send(&to, &file),
        Commands::Register { name, addr } => commands::receivers::register(&name, &addr)?,
        Commands::Receivers => commands::receivers::list()?,
        Commands::Pair {
            name,
            addr,
            id,
            ssh,
        } => commands::receivers::pair(&name, &addr, &id, ssh.as_deref())?,
        Commands::Receiver(ReceiverCommands::Enable {
            listen,
            trust,
            root,
        }) => commands::receiver::enable(&listen, &trust[0], &trust[1], &root)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    // Unknown subcommands and bad flags print usage and exit 1; --help and
    // --version stay successful.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
            let _ = e.print();
            return code;
        },
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERR {e:#}");
            ExitCode::FAILURE
        },
    }
}
