//! dyskctl: mount Azure page blobs as local block devices

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dysk::channel::DeviceFileOpener;
use dysk::client::{CreateRequest, DyskClient, LeaseOptions, MountRequest};
use dysk::config::Config;
use dysk::device::DeviceRecord;
use dysk::lease::CleanupWarning;
use dysk::output::{self, OutputFormat};
use dysk::pv::{self, PvOptions};
use dysk::resolve::SystemResolver;
use dysk::store::azure::AzureConnector;
use dysk::{DyskError, Result};

#[derive(Parser, Debug)]
#[command(name = "dyskctl", version, about = "Mount Azure page blobs as block devices")]
struct Cli {
    /// Configuration file (defaults to /etc/dysk/config.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    /// Control device of the dysk module
    #[arg(long, global = true)]
    device: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct AccountArgs {
    /// Azure storage account name
    #[arg(long, short = 'a', env = "DYSK_ACCOUNT")]
    account: Option<String>,

    /// Azure storage account key
    #[arg(long, short = 'k', env = "DYSK_KEY", hide_env_values = true)]
    key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mount a page blob as a block device
    Mount(MountArgs),

    /// Create a page blob without mounting it
    Create(CreateArgs),

    /// Delete a page blob
    Delete(DeleteArgs),

    /// Convert a dysk JSON file into a Kubernetes persistent volume
    ConvertPv(ConvertPvArgs),

    /// Mount a page blob described by a dysk JSON file
    MountFile {
        /// JSON file path
        #[arg(long, short = 'f')]
        file: PathBuf,
    },

    /// Unmount a dysk from this host
    Unmount {
        /// Block device name
        #[arg(long, short = 'd')]
        device_name: String,

        /// Break the lease on the dysk's page blob after unmounting
        #[arg(long, short = 'b')]
        break_lease: bool,
    },

    /// Get a dysk mounted on this host
    Get {
        /// Block device name
        #[arg(long, short = 'd')]
        device_name: String,
    },

    /// List all dysks mounted on this host
    List,
}

#[derive(Args, Debug)]
struct MountArgs {
    #[command(flatten)]
    account: AccountArgs,

    /// Page blob name (defaults to the device name)
    #[arg(long, short = 'p')]
    pageblob_name: Option<String>,

    /// Blob container name
    #[arg(long = "container-name", short = 'c')]
    container: Option<String>,

    /// Block device name; a random name is used when empty
    #[arg(long, short = 'd')]
    device_name: Option<String>,

    /// An existing lease id on the page blob
    #[arg(long, short = 'i')]
    lease_id: Option<String>,

    /// The page blob carries a VHD footer
    #[arg(long, short = 'v', action = ArgAction::Set)]
    vhd: Option<bool>,

    /// Mount read-only
    #[arg(long, short = 'r')]
    read_only: bool,

    /// Acquire a lease when none is given
    #[arg(long, short = 'l', action = ArgAction::Set, default_value_t = true)]
    auto_lease: bool,

    /// Break an existing lease on the page blob
    #[arg(long, short = 'b')]
    break_lease: bool,

    #[command(subcommand)]
    auto_create: Option<MountSubcommand>,
}

#[derive(Subcommand, Debug)]
enum MountSubcommand {
    /// Create the page blob, then mount it
    AutoCreate {
        /// Page blob size in GB
        #[arg(long, short = 'n')]
        size: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[command(flatten)]
    account: AccountArgs,

    /// Page blob name; a random name is used when empty
    #[arg(long, short = 'p')]
    pageblob_name: Option<String>,

    /// Blob container name
    #[arg(long = "container-name", short = 'c')]
    container: Option<String>,

    /// Write a VHD footer to the page blob
    #[arg(long, short = 'v', action = ArgAction::Set)]
    vhd: Option<bool>,

    /// Lease the new page blob
    #[arg(long, short = 'l')]
    auto_lease: bool,

    /// Page blob size in GB
    #[arg(long, short = 'n')]
    size: Option<u64>,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    #[command(flatten)]
    account: AccountArgs,

    /// Page blob name
    #[arg(long, short = 'p')]
    pageblob_name: String,

    /// Blob container name
    #[arg(long = "container-name", short = 'c')]
    container: Option<String>,

    /// Delete under this lease id
    #[arg(long, short = 'i')]
    lease_id: Option<String>,

    /// Break any lease before deleting
    #[arg(long, short = 'b')]
    break_lease: bool,
}

#[derive(Args, Debug)]
struct ConvertPvArgs {
    /// JSON file path; stdin is read when omitted
    #[arg(long, short = 'f')]
    file: Option<PathBuf>,

    /// Flex volume secret name
    #[arg(long)]
    secret_name: String,

    /// Flex volume secret namespace
    #[arg(long)]
    secret_namespace: Option<String>,

    /// Volume namespace
    #[arg(long)]
    namespace: Option<String>,

    #[arg(long, default_value = "Retain")]
    reclaim_policy: String,

    #[arg(long, default_value = "ReadWriteOnce")]
    access_mode: String,

    /// Filesystem type
    #[arg(long = "fs-type", alias = "fsType", default_value = "ext4")]
    fs_type: String,

    #[arg(long = "storageclass-name")]
    storage_class: Option<String>,

    /// Labels as key1=val1,key2=val2
    #[arg(long, default_value = "")]
    labels: String,

    /// Force a read-only volume
    #[arg(long)]
    read_only: bool,
}

fn print_status(message: &str) {
    eprintln!("Status:\n{}", message);
}

fn print_warnings(warnings: &[CleanupWarning]) {
    for warning in warnings {
        eprintln!("Warning:\n{}", warning);
    }
}

fn print_records(records: &[DeviceRecord], format: OutputFormat) -> Result<()> {
    print!("{}", output::render_records(records, format)?);
    if format == OutputFormat::Json {
        println!();
    }
    Ok(())
}

fn build_client(config: &Config, account: Option<&AccountArgs>) -> DyskClient {
    let channels = Arc::new(DeviceFileOpener::new(&config.device.path));
    let connector = Arc::new(AzureConnector::new(
        config.storage.domain.clone(),
        config.storage.request_timeout,
    ));
    let client = DyskClient::new(channels, connector, Arc::new(SystemResolver))
        .with_domain(config.storage.domain.clone());

    let account_name = account
        .and_then(|a| a.account.clone())
        .or_else(|| config.storage.account.clone());
    let key = account
        .and_then(|a| a.key.clone())
        .or_else(|| config.storage.key.clone());

    match (account_name, key) {
        (Some(account_name), Some(key)) => client.with_credentials(account_name, key),
        _ => client,
    }
}

fn read_record(file: Option<&PathBuf>) -> Result<DeviceRecord> {
    let content = match file {
        Some(path) => std::fs::read(path)?,
        None => {
            let mut content = Vec::new();
            std::io::stdin().read_to_end(&mut content)?;
            content
        }
    };
    DeviceRecord::from_json(&content)
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let format = cli.output;

    match cli.command {
        Commands::Mount(args) => {
            let client = build_client(&config, Some(&args.account));
            let (auto_create, size_gb) = match args.auto_create {
                Some(MountSubcommand::AutoCreate { size }) => {
                    (true, size.unwrap_or(config.defaults.size_gb))
                }
                None => (false, config.defaults.size_gb),
            };

            let request = MountRequest {
                device_name: args.device_name,
                object_name: args.pageblob_name,
                container: args
                    .container
                    .unwrap_or_else(|| config.defaults.container.clone()),
                size_gb,
                vhd: args.vhd.unwrap_or(config.defaults.vhd),
                read_only: args.read_only,
                auto_create,
                // A blob created here is always leased for the mount
                auto_lease: args.auto_lease || auto_create,
                break_lease: args.break_lease,
                lease_id: args.lease_id.filter(|l| !l.is_empty()),
            };
            debug!(?request, "mount request");

            let record = client.mount(&request).await?;
            print_records(&[record], format)
        }

        Commands::Create(args) => {
            let client = build_client(&config, Some(&args.account));
            let request = CreateRequest {
                name: args.pageblob_name,
                container: args
                    .container
                    .unwrap_or_else(|| config.defaults.container.clone()),
                size_gb: args.size.unwrap_or(config.defaults.size_gb),
                vhd: args.vhd.unwrap_or(config.defaults.vhd),
                lease: args.auto_lease,
            };

            let created = client.create(&request).await?;
            println!("{}", output::render_created(&created, format)?.trim_end());
            Ok(())
        }

        Commands::Delete(args) => {
            let client = build_client(&config, Some(&args.account));
            let container = args
                .container
                .unwrap_or_else(|| config.defaults.container.clone());

            let outcome = client
                .delete(
                    &container,
                    &args.pageblob_name,
                    args.lease_id.as_deref().filter(|l| !l.is_empty()),
                    args.break_lease,
                )
                .await?;
            print_warnings(&outcome.warnings);
            print_status(&format!("Page blob /{}/{} deleted", container, args.pageblob_name));
            Ok(())
        }

        Commands::ConvertPv(args) => {
            let record = read_record(args.file.as_ref())?;
            let options = PvOptions {
                secret_name: args.secret_name,
                secret_namespace: args.secret_namespace,
                namespace: args.namespace,
                reclaim_policy: args.reclaim_policy,
                access_mode: args.access_mode,
                fs_type: Some(args.fs_type),
                storage_class: args.storage_class,
                read_only: args.read_only,
                labels: pv::parse_labels(&args.labels)?,
            };

            let volume = pv::to_persistent_volume(&record, &options)?;
            println!("{}", output::to_json(&volume)?);
            Ok(())
        }

        Commands::MountFile { file } => {
            let client = build_client(&config, None);
            let record = read_record(Some(&file))?;
            let record = client
                .mount_record(record, LeaseOptions::default())
                .await?;
            print_records(&[record], format)
        }

        Commands::Unmount {
            device_name,
            break_lease,
        } => {
            let client = build_client(&config, None);
            let outcome = client.unmount(&device_name, break_lease).await?;
            print_warnings(&outcome.warnings);
            print_status(&format!("Device:{} unmounted", device_name));
            Ok(())
        }

        Commands::Get { device_name } => {
            let client = build_client(&config, None);
            let record = client.get(&device_name)?;
            print_records(&[record], format)
        }

        Commands::List => {
            let client = build_client(&config, None);
            let records = client.list()?;
            print_records(&records, format)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Err:\n{}", e);
            std::process::exit(DyskError::from(e).exit_code());
        }
    };
    if let Some(device) = &cli.device {
        config.device.path = device.clone();
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Err:\n{}", e);
        std::process::exit(DyskError::from(e).exit_code());
    }

    // Initialize logging; stdout is reserved for command output
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, config).await {
        eprintln!("Err:\n{}", e);
        std::process::exit(e.exit_code());
    }
}
