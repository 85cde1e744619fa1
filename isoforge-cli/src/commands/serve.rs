use crate::output;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use isoforge_rpc::RpcServer;
use isoforge_service::{JobRegistry, SystemRunner};

/// Run the HTTP build API
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (overrides the config file)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// YAML configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Base directory for build workspaces
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,
}

pub async fn execute(args: ServeArgs) -> Result<()> {
    let mut config = super::load_config(args.config.as_deref(), args.workspace)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .wrap_err_with(|| format!("Invalid bind address '{}'", config.server.bind))?;

    output::status("Workspace", &config.workspace.root.display().to_string());
    output::status("Listening", &format!("http://{}", addr));

    let runner = Arc::new(SystemRunner::from_config(&config.commands));
    let server = RpcServer::new(JobRegistry::new(config, runner));
    server.serve(addr).await?;

    output::info("Server stopped");
    Ok(())
}
