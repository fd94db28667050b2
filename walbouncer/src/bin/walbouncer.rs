//
// Main entry point for the walbouncer executable
//
use anyhow::Context;
use clap::Parser;
use tracing::info;
use utils::logging::{self, LogFormat};

use walbouncer::defaults::{DEFAULT_LISTEN_PORT, DEFAULT_MASTER_HOST, DEFAULT_MASTER_PORT};
use walbouncer::{wal_service, WalBouncerConf};

const ABOUT: &str = r#"
walbouncer proxies PostgreSQL streaming replication connections and
optionally filters the WAL stream down to a subset of tablespaces, chosen
per standby through its application_name.
"#;

#[derive(Parser)]
#[command(name = "walbouncer", about = ABOUT, long_about = None, disable_help_flag = true)]
struct Args {
    /// Connect to the primary on this host.
    #[arg(short = 'h', long, default_value = DEFAULT_MASTER_HOST)]
    host: String,
    /// Run the proxy on this port.
    #[arg(short = 'p', long, default_value_t = DEFAULT_LISTEN_PORT)]
    port: u16,
    /// Connect to the primary on this port.
    #[arg(short = 'P', long, default_value_t = DEFAULT_MASTER_PORT)]
    masterport: u16,
    /// Print this message.
    #[arg(short = '?', long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            // invalid arguments exit with 1, not clap's usual 2
            eprint!("{e}");
            std::process::exit(1);
        }
        Err(e) => {
            // --help and friends
            print!("{e}");
            std::process::exit(0);
        }
    };

    logging::init(LogFormat::Plain)?;

    let conf = WalBouncerConf {
        listen_port: args.port,
        master_host: args.host,
        master_port: args.masterport,
    };

    let listen_addr = format!("0.0.0.0:{}", conf.listen_port);
    info!(
        "starting walbouncer on {}, proxying primary {}:{}",
        listen_addr, conf.master_host, conf.master_port
    );
    let listener = utils::tcp_listener::bind(&listen_addr)
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    wal_service::task_main(conf, listener).await
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}
