use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::Bytes;
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{info, Level};

use rafs_tool::{Config, Session};

const DEFAULT_POWER_SUPPLY: &str = "/sys/class/power_supply";

fn cli() -> Command {
    let name = || Arg::new("name").help("File name on the partition").required(true);

    Command::new("rafs")
        .version("0.1.0")
        .about("Manage RAFS flash images")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("JSON configuration file")
                .global(true),
        )
        .arg(
            Arg::new("image-dir")
                .long("image-dir")
                .help("Directory holding <partition>.img files")
                .global(true),
        )
        .arg(
            Arg::new("partition")
                .long("partition")
                .short('p')
                .help("Partition name")
                .global(true),
        )
        .arg(
            Arg::new("host-power")
                .long("host-power")
                .help("Gate writes on the host battery")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("format").about("Create an empty file system").arg(
                Arg::new("force")
                    .long("force")
                    .help("Format even if the partition is mounted")
                    .action(ArgAction::SetTrue),
            ),
        )
        .subcommand(Command::new("ls").about("List files"))
        .subcommand(
            Command::new("put")
                .about("Copy a host file into the partition")
                .arg(Arg::new("source").help("Host file").required(true))
                .arg(name().required(false)),
        )
        .subcommand(
            Command::new("get")
                .about("Copy a file out of the partition")
                .arg(name())
                .arg(Arg::new("output").help("Host file, stdout when omitted")),
        )
        .subcommand(Command::new("rm").about("Delete a file").arg(name()))
        .subcommand(Command::new("compact").about("Reclaim directory slots"))
        .subcommand(Command::new("statfs").about("Show space usage"))
        .subcommand(Command::new("fsck").about("Check, repair and compact the tables"))
        .subcommand(
            Command::new("offset")
                .about("Byte offset of a file within the partition")
                .arg(name()),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::load(Path::new(path))
            .with_context(|| format!("Loading config {}", path))?,
        None => Config::default(),
    };
    if let Some(dir) = matches.get_one::<String>("image-dir") {
        config.image_dir = PathBuf::from(dir);
    }
    if let Some(partition) = matches.get_one::<String>("partition") {
        config.partition = partition.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    let level: Level = config
        .log_level
        .parse()
        .with_context(|| format!("Invalid log level {:?}", config.log_level))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    info!("Configuration: {:?}", config);
    let mut session = Session::new(config)?;
    if matches.get_flag("host-power") {
        session.apply_host_power(Path::new(DEFAULT_POWER_SUPPLY))?;
    }

    let Some((command, args)) = matches.subcommand() else {
        return Ok(());
    };

    if command == "format" {
        session.format(args.get_flag("force"))?;
        println!("Formatted {}", session.config().partition);
        return Ok(session.close()?);
    }
    if command == "fsck" {
        let report = session.fsck().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(session.close()?);
    }

    let partition = session.config().partition.clone();
    session
        .mount()
        .await
        .with_context(|| format!("Mounting {}", partition))?;

    match command {
        "ls" => {
            for stat in session.list()? {
                println!(
                    "{:<16} {:>10} seq={:<5} reads={}",
                    stat.filename, stat.file_size, stat.sequence_count, stat.access_count
                );
            }
        }
        "put" => {
            let source = args.get_one::<String>("source").context("missing source")?;
            let name = match args.get_one::<String>("name") {
                Some(name) => name.clone(),
                None => Path::new(source)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context("source has no file name")?
                    .to_string(),
            };
            let data = tokio::fs::read(source)
                .await
                .with_context(|| format!("Reading {}", source))?;
            let len = data.len();
            session.put(&name, Bytes::from(data)).await?;
            println!("Wrote {} ({} bytes)", name, len);
        }
        "get" => {
            let name = args.get_one::<String>("name").context("missing name")?;
            let contents = session.get(name)?;
            match args.get_one::<String>("output") {
                Some(output) => tokio::fs::write(output, &contents)
                    .await
                    .with_context(|| format!("Writing {}", output))?,
                None => {
                    use tokio::io::AsyncWriteExt;
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&contents).await?;
                    stdout.flush().await?;
                }
            }
        }
        "rm" => {
            let name = args.get_one::<String>("name").context("missing name")?;
            session.remove(name).await?;
            println!("Removed {}", name);
        }
        "compact" => match session.compact().await? {
            Some(free) => println!("Compacted, {} directory slots free", free),
            None => println!("Already clean"),
        },
        "statfs" => {
            let stat = session.statfs()?;
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        "offset" => {
            let name = args.get_one::<String>("name").context("missing name")?;
            println!("{}", session.file_offset(name)?);
        }
        other => anyhow::bail!("Unknown command {}", other),
    }

    session.close()?;
    Ok(())
}
