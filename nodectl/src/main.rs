// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use ec2_labels::{Ec2Labels, ImdsClient};
use fs_err as fs;
use join_auth::{parse_roles, FileTokenStore, SystemRole, TokenRule, TokenStore};
use node_command::Invite;

mod config;
mod node_command;

/// Cluster join administration
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "NODECTL_CONFIG", default_value = "nodectl.toml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage node invitations
    #[clap(subcommand)]
    Nodes(NodesCommand),
    /// Manage provisioning tokens
    #[clap(subcommand)]
    Tokens(TokensCommand),
    /// Inspect instance identity documents
    #[clap(subcommand)]
    Iid(IidCommand),
    /// Import EC2 tags of this instance once and print them as labels
    Labels(LabelsArgs),
}

#[derive(Subcommand)]
enum NodesCommand {
    /// Generate an invite token for a new node
    Add(AddArgs),
    /// Allow an AWS account to join with a token
    Allow(AllowArgs),
}

#[derive(Subcommand)]
enum TokensCommand {
    /// List provisioning tokens
    Ls,
    /// Delete a provisioning token
    Rm {
        /// token to delete
        token: String,
    },
}

#[derive(Subcommand)]
enum IidCommand {
    /// Verify a base64 identity document against the trust store and print its claims
    Verify {
        /// file containing the document
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Parser)]
struct AddArgs {
    /// comma separated roles of the new node
    #[arg(long, default_value = "node", value_parser = parse_roles)]
    roles: BTreeSet<SystemRole>,

    /// lifetime of the token
    #[arg(long, default_value = "30m", value_parser = humantime::parse_duration)]
    ttl: Duration,

    /// use this token instead of a random one
    #[arg(long)]
    token: Option<String>,

    #[arg(long, value_enum, default_value = "text")]
    format: Format,
}

#[derive(Parser)]
struct AllowArgs {
    #[arg(long)]
    token: String,

    /// AWS account id
    #[arg(long)]
    account: String,

    /// allowed region, may be repeated; none means any region
    #[arg(long = "region")]
    regions: Vec<String>,
}

#[derive(Parser)]
struct LabelsArgs {
    /// instance metadata endpoint
    #[arg(long, default_value = ec2_labels::IMDS_ENDPOINT)]
    endpoint: String,
}

async fn cmd_nodes_add(config: &Config, args: AddArgs) -> Result<()> {
    let store = FileTokenStore::new(&config.cluster.token_file);
    let token = node_command::generate_enrollment_token(
        &store,
        args.roles,
        args.ttl,
        args.token,
        SystemTime::now(),
    )
    .await?;
    let ca_pem = fs::read_to_string(&config.cluster.ca_cert)?;
    let invite = Invite {
        token: token.name,
        roles: token.roles,
        ttl: args.ttl,
        ca_pins: node_command::ca_pins(&ca_pem)?,
        auth_server: config
            .cluster
            .auth_servers
            .first()
            .cloned()
            .context("no auth server configured")?,
    };
    match args.format {
        Format::Text => print!("{}", invite.render_text()),
        Format::Json => println!("{}", invite.render_json()?),
    }
    Ok(())
}

async fn cmd_nodes_allow(config: &Config, args: AllowArgs) -> Result<()> {
    let store = FileTokenStore::new(&config.cluster.token_file);
    let rule = TokenRule::new(args.account, args.regions);
    let token = node_command::allow_account(&store, &args.token, rule).await?;
    println!("token {} now allows {} rule(s)", token.name, token.allow.len());
    Ok(())
}

async fn cmd_tokens_ls(config: &Config) -> Result<()> {
    let store = FileTokenStore::new(&config.cluster.token_file);
    let now = SystemTime::now();
    for token in store.list().await? {
        let state = if token.is_expired(now) { " (expired)" } else { "" };
        println!(
            "{}\t{}\t{}{state}",
            token.name,
            node_command::roles_string(&token.roles),
            humantime::format_rfc3339_seconds(token.expires),
        );
    }
    Ok(())
}

async fn cmd_tokens_rm(config: &Config, token: &str) -> Result<()> {
    let store = FileTokenStore::new(&config.cluster.token_file);
    if !store.delete(token).await? {
        anyhow::bail!("token {token} not found");
    }
    println!("token {token} deleted");
    Ok(())
}

fn cmd_iid_verify(config: &Config, file: &Path) -> Result<()> {
    let trust_store = config.verifier.load_trust_store()?;
    let document = fs::read(file)?;
    let claims = iid_qvl::verify_identity_document(&document, &trust_store)?;
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

async fn cmd_labels(args: LabelsArgs) -> Result<()> {
    let client = ImdsClient::with_endpoint(args.endpoint)?;
    let labels = Ec2Labels::new(Arc::new(client));
    labels.sync().await?;
    for (key, value) in labels.get() {
        println!("{key}={value}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let cli = Cli::parse();

    let load_config = || Config::load_from_file(&cli.config);
    match cli.command {
        Commands::Nodes(NodesCommand::Add(args)) => cmd_nodes_add(&load_config()?, args).await?,
        Commands::Nodes(NodesCommand::Allow(args)) => {
            cmd_nodes_allow(&load_config()?, args).await?
        }
        Commands::Tokens(TokensCommand::Ls) => cmd_tokens_ls(&load_config()?).await?,
        Commands::Tokens(TokensCommand::Rm { token }) => {
            cmd_tokens_rm(&load_config()?, &token).await?
        }
        Commands::Iid(IidCommand::Verify { file }) => cmd_iid_verify(&load_config()?, &file)?,
        Commands::Labels(args) => cmd_labels(args).await?,
    }
    Ok(())
}
