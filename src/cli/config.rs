//! CLI subcommand: `dockside config`

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;
use crate::paths::Paths;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective settings
    Show {
        #[arg(short, long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },

    /// Print one setting; without a key, list every `key = value`
    Get {
        /// e.g. docker.exec_timeout_secs
        key: Option<String>,
    },

    /// Change one setting and write the file back
    Set {
        /// e.g. docker.host
        key: String,

        /// New value; an empty string clears docker.host
        value: String,
    },

    /// Print where the config file lives
    Path,

    /// Write the commented template
    Init {
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Toml,
    Json,
}

pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => print!("{}", render(&Config::load()?, format)?),
        ConfigCommands::Get { key: Some(key) } => println!("{}", Config::load()?.get_value(&key)?),
        ConfigCommands::Get { key: None } => print!("{}", list_values(&Config::load()?)?),
        ConfigCommands::Set { key, value } => {
            let mut config = Config::load()?;
            config.set_value(&key, &value)?;
            config.save()?;
            println!("{} = {}", key, config.get_value(&key)?);
        }
        ConfigCommands::Path => println!("{}", Config::config_path()?.display()),
        ConfigCommands::Init { force } => init(Paths::resolve()?, force)?,
    }
    Ok(())
}

fn render(config: &Config, format: Format) -> Result<String> {
    Ok(match format {
        Format::Toml => toml::to_string_pretty(config)?,
        Format::Json => format!("{}\n", serde_json::to_string_pretty(config)?),
    })
}

fn list_values(config: &Config) -> Result<String> {
    let mut out = String::new();
    for key in Config::KEYS {
        out.push_str(&format!("{} = {}\n", key, config.get_value(key)?));
    }
    Ok(out)
}

fn init(paths: Paths, force: bool) -> Result<()> {
    let path = paths.config_file();
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }

    Config {
        paths,
        ..Config::default()
    }
    .save_with_template()
}
