/*!
 * Xenon CLI - Command Line Interface
 *
 * Thin layer over the library: every subcommand resolves a URI through the
 * adaptor registry and calls the public scheduler or file system API.
 * Unrecovered errors print the adaptor-qualified message and exit 1.
 */

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use xenon::error::EXIT_FAILURE;
use xenon::filesystem::{CopyEngine, CopyMode, ListOptions};
use xenon::forwarder::StreamForwarder;
use xenon::registry::{AdaptorDescriptor, AdaptorRegistry};
use xenon::scheduler::{JobDescription, JobTask};
use xenon::{logging, Credential, JobStatus, XenonConfig};

#[derive(Parser)]
#[command(name = "xenon")]
#[command(version, about = "Submit jobs and move files through pluggable scheduler and file system adaptors", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/xenon/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Adaptor property, repeatable (e.g. -P poll.delay=5s)
    #[arg(short = 'P', long = "property", value_name = "KEY=VALUE", global = true)]
    properties: Vec<String>,

    /// Remote user name
    #[arg(long, global = true)]
    user: Option<String>,

    /// Private key for SSH authentication
    #[arg(long, value_name = "PATH", global = true)]
    key_file: Option<PathBuf>,

    /// Authenticate through the SSH agent
    #[arg(long, global = true)]
    agent: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the available adaptors
    Adaptors,

    /// List the queues of a scheduler
    Queues {
        /// Scheduler URI, e.g. slurm://user@cluster
        uri: String,
    },

    /// List the jobs a scheduler knows about
    Jobs {
        uri: String,
        /// Restrict to these queues
        queues: Vec<String>,
    },

    /// Submit a batch job
    Submit {
        uri: String,

        /// Executable to run (may come from --job-file instead)
        executable: Option<String>,

        /// Arguments for the executable
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,

        /// TOML job description
        #[arg(long, value_name = "PATH")]
        job_file: Option<PathBuf>,

        /// Wait up to this many milliseconds for the job (0 = forever)
        #[arg(long, value_name = "MS")]
        wait: Option<i64>,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        queue: Option<String>,

        #[arg(long, value_name = "DIR")]
        workdir: Option<String>,

        #[arg(long, value_name = "PATH")]
        stdout: Option<String>,

        #[arg(long, value_name = "PATH")]
        stderr: Option<String>,

        /// Environment variable, repeatable
        #[arg(long = "env", value_name = "KEY=VALUE")]
        environment: Vec<String>,

        /// Maximum runtime in minutes
        #[arg(long, value_name = "MINUTES")]
        max_runtime: Option<u32>,
    },

    /// Show the status of jobs
    Status {
        uri: String,
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// Cancel a job
    Cancel { uri: String, job_id: String },

    /// Run an interactive job with its streams attached to this terminal
    Exec {
        uri: String,
        executable: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },

    /// List a directory
    List {
        /// File system URI, e.g. file:// or sftp://user@host
        uri: String,
        path: PathBuf,
        #[arg(short, long)]
        recursive: bool,
        /// Include hidden entries
        #[arg(short, long)]
        all: bool,
    },

    /// Copy a file between file systems
    Copy {
        source_uri: String,
        source: PathBuf,
        target_uri: String,
        target: PathBuf,
        /// create, replace or ignore
        #[arg(long, default_value = "create")]
        mode: CopyMode,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("xenon: {}", e);
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut config = match &cli.config {
        Some(path) => XenonConfig::load(path)?,
        None => XenonConfig::load_or_default()?,
    };
    config.verbose |= cli.verbose;
    logging::init_logging(&config)?;

    let registry = AdaptorRegistry::from_config(&config)?;
    let properties = parse_pairs(&cli.properties, "property")?;
    let credential = credential(&cli);

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| anyhow!("failed to start async runtime: {}", e))?;
    let outcome = runtime.block_on(dispatch(&cli, &registry, &credential, properties));
    // stdin forwarding may still be parked in a blocking read
    runtime.shutdown_timeout(Duration::from_millis(100));
    outcome
}

fn credential(cli: &Cli) -> Credential {
    let user = cli
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_default();

    if let Some(key_file) = &cli.key_file {
        let credential = Credential::key_file(user, key_file.clone());
        match std::env::var("XENON_PASSPHRASE") {
            Ok(passphrase) => credential.with_passphrase(passphrase),
            Err(_) => credential,
        }
    } else if cli.agent {
        Credential::agent(user)
    } else if let Ok(password) = std::env::var("XENON_PASSWORD") {
        Credential::password(user, password)
    } else {
        Credential::Default
    }
}

fn parse_pairs(pairs: &[String], what: &str) -> anyhow::Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("{} `{}` is not KEY=VALUE", what, pair))
        })
        .collect()
}

async fn dispatch(
    cli: &Cli,
    registry: &AdaptorRegistry,
    credential: &Credential,
    properties: BTreeMap<String, String>,
) -> anyhow::Result<u8> {
    let json = cli.json;

    match &cli.command {
        Command::Adaptors => {
            print_adaptors(registry, json)?;
            Ok(0)
        }

        Command::Queues { uri } => {
            let scheduler = registry
                .create_scheduler_from_uri(uri, credential, properties)
                .await?;
            let queues = scheduler.queue_names().await;
            let default = scheduler.default_queue_name().await;
            scheduler.close().await?;

            let (queues, default) = (queues?, default?);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "queues": queues,
                        "default": default,
                    }))?
                );
            } else {
                for queue in queues {
                    let marker = if Some(&queue) == default.as_ref() { " (default)" } else { "" };
                    println!("{}{}", queue, marker);
                }
            }
            Ok(0)
        }

        Command::Jobs { uri, queues } => {
            let scheduler = registry
                .create_scheduler_from_uri(uri, credential, properties)
                .await?;
            let jobs = scheduler.get_jobs(queues).await;
            scheduler.close().await?;

            let jobs = jobs?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in jobs {
                    println!("{}", job);
                }
            }
            Ok(0)
        }

        Command::Submit {
            uri,
            executable,
            arguments,
            job_file,
            wait,
            name,
            queue,
            workdir,
            stdout,
            stderr,
            environment,
            max_runtime,
        } => {
            let mut description = match job_file {
                Some(path) => load_job_file(path)?,
                None => JobDescription::default(),
            };
            if let Some(executable) = executable {
                description.task = Some(JobTask::Command {
                    executable: executable.clone(),
                    arguments: arguments.clone(),
                });
            }
            if description.task.is_none() {
                bail!("no executable given and no task in the job file");
            }
            description.name = name.clone().or(description.name);
            description.queue_name = queue.clone().or(description.queue_name);
            description.working_directory = workdir.clone().or(description.working_directory);
            description.stdout = stdout.clone().or(description.stdout);
            description.stderr = stderr.clone().or(description.stderr);
            description.max_runtime_minutes = max_runtime.or(description.max_runtime_minutes);
            description
                .environment
                .extend(parse_pairs(environment, "environment variable")?);

            let scheduler = registry
                .create_scheduler_from_uri(uri, credential, properties)
                .await?;

            let outcome = async {
                let job_id = scheduler.submit_batch_job(&description).await?;
                let timeout = match wait {
                    Some(timeout) => *timeout,
                    // jobs on an embedded scheduler die with the session
                    None if scheduler.capabilities().is_embedded => {
                        eprintln!("{}: waiting, the local scheduler ends with this process", job_id);
                        0
                    }
                    None => {
                        if json {
                            println!("{}", serde_json::json!({ "job_id": job_id }));
                        } else {
                            println!("{}", job_id);
                        }
                        return Ok(0);
                    }
                };

                let status = scheduler.wait_until_done(&job_id, timeout).await?;
                print_statuses(&[status.clone()], json)?;
                status.maybe_raise()?;
                Ok::<u8, anyhow::Error>(exit_byte(&status))
            }
            .await;

            scheduler.close().await?;
            outcome
        }

        Command::Status { uri, job_ids } => {
            let scheduler = registry
                .create_scheduler_from_uri(uri, credential, properties)
                .await?;
            let statuses = scheduler.get_job_statuses(job_ids).await;
            scheduler.close().await?;

            print_statuses(&statuses, json)?;
            if statuses.iter().any(JobStatus::is_unreachable) {
                return Ok(EXIT_FAILURE as u8);
            }
            Ok(0)
        }

        Command::Cancel { uri, job_id } => {
            let scheduler = registry
                .create_scheduler_from_uri(uri, credential, properties)
                .await?;
            let status = scheduler.cancel_job(job_id).await;
            scheduler.close().await?;

            print_statuses(&[status?], json)?;
            Ok(0)
        }

        Command::Exec {
            uri,
            executable,
            arguments,
        } => {
            let scheduler = registry
                .create_scheduler_from_uri(uri, credential, properties)
                .await?;
            let outcome = exec(scheduler.as_ref(), executable, arguments).await;
            scheduler.close().await?;
            outcome
        }

        Command::List {
            uri,
            path,
            recursive,
            all,
        } => {
            let fs = registry
                .create_file_system_from_uri(uri, credential, properties)
                .await?;
            let mut options = if *recursive {
                ListOptions::recursive()
            } else {
                ListOptions::shallow()
            };
            if *all {
                options = options.include_hidden();
            }
            let entries = fs.list(path, options).await;
            fs.close().await?;

            let mut entries = entries?;
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                let mut table = create_table();
                table.set_header(header(&["Name", "Type", "Size", "Modified"]));
                for entry in entries {
                    let kind = if entry.is_dir() {
                        "dir"
                    } else if entry.is_file() {
                        "file"
                    } else {
                        "link"
                    };
                    table.add_row(vec![
                        Cell::new(entry.path.display()),
                        Cell::new(kind),
                        Cell::new(entry.metadata.size),
                        Cell::new(
                            entry
                                .metadata
                                .modified
                                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                                .unwrap_or_default(),
                        )
                        .fg(Color::DarkGrey),
                    ]);
                }
                println!("{}", table);
            }
            Ok(0)
        }

        Command::Copy {
            source_uri,
            source,
            target_uri,
            target,
            mode,
        } => {
            let from: Arc<dyn xenon::FileSystem> = Arc::from(
                registry
                    .create_file_system_from_uri(source_uri, credential, properties.clone())
                    .await?,
            );
            let to: Arc<dyn xenon::FileSystem> = Arc::from(
                registry
                    .create_file_system_from_uri(target_uri, credential, properties)
                    .await?,
            );

            let engine = CopyEngine::new();
            let outcome = async {
                let id = engine
                    .start(from.clone(), source, to.clone(), target, *mode)
                    .await?;
                let status = engine.wait_until_done(&id, 0).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    println!(
                        "{} {} ({} bytes)",
                        status.copy_id(),
                        status.state(),
                        status.bytes_copied()
                    );
                }
                status.maybe_raise()?;
                Ok::<u8, anyhow::Error>(0)
            }
            .await;

            from.close().await?;
            to.close().await?;
            outcome
        }
    }
}

async fn exec(
    scheduler: &dyn xenon::Scheduler,
    executable: &str,
    arguments: &[String],
) -> anyhow::Result<u8> {
    let description = JobDescription::command(executable, arguments.iter().cloned());
    let mut job = scheduler.submit_interactive_job(&description).await?;

    let mut pumps = Vec::new();
    if let Some(stdout) = job.streams.stdout.take() {
        pumps.push(StreamForwarder::new("stdout", stdout, Some(tokio::io::stdout())));
    }
    if let Some(stderr) = job.streams.stderr.take() {
        pumps.push(StreamForwarder::new("stderr", stderr, Some(tokio::io::stderr())));
    }
    let stdin = job
        .streams
        .stdin
        .take()
        .map(|stdin| StreamForwarder::new("stdin", tokio::io::stdin(), Some(stdin)));

    let status = scheduler.wait_until_done(&job.job_id, 0).await?;

    for pump in pumps {
        pump.terminate(Duration::from_secs(1)).await;
    }
    if let Some(stdin) = stdin {
        stdin.terminate(Duration::ZERO).await;
    }

    status.maybe_raise()?;
    Ok(exit_byte(&status))
}

fn exit_byte(status: &JobStatus) -> u8 {
    match status.exit_code() {
        Some(code) => u8::try_from(code).unwrap_or(EXIT_FAILURE as u8),
        None => 0,
    }
}

fn load_job_file(path: &Path) -> anyhow::Result<JobDescription> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read job file {}: {}", path.display(), e))?;
    Ok(JobDescription::from_toml(&contents)?)
}

fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).fg(Color::Cyan).add_attribute(Attribute::Bold))
        .collect()
}

fn print_adaptors(registry: &AdaptorRegistry, json: bool) -> anyhow::Result<()> {
    let sections: [(&str, Vec<&'static AdaptorDescriptor>); 2] = [
        ("scheduler", registry.scheduler_descriptors()),
        ("file system", registry.file_descriptors()),
    ];

    if json {
        let listing: Vec<_> = sections
            .iter()
            .flat_map(|(kind, descriptors)| {
                descriptors.iter().map(move |d| {
                    serde_json::json!({
                        "kind": kind,
                        "name": d.name,
                        "description": d.description,
                        "schemes": d.schemes,
                        "locations": d.location_patterns,
                        "properties": d.properties.iter().map(|p| serde_json::json!({
                            "name": p.name,
                            "type": p.property_type.to_string(),
                            "default": p.default,
                            "description": p.description,
                        })).collect::<Vec<_>>(),
                    })
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    let mut table = create_table();
    table.set_header(header(&["Kind", "Adaptor", "Schemes", "Locations", "Description"]));
    for (kind, descriptors) in &sections {
        for d in descriptors {
            table.add_row(vec![
                Cell::new(kind),
                Cell::new(d.name).fg(Color::Green),
                Cell::new(d.schemes.join(", ")),
                Cell::new(d.location_patterns.join(" | ")),
                Cell::new(d.description).fg(Color::DarkGrey),
            ]);
        }
    }
    println!("{}", table);
    Ok(())
}

fn print_statuses(statuses: &[JobStatus], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(statuses)?);
        return Ok(());
    }

    let mut table = create_table();
    table.set_header(header(&["Job", "State", "Done", "Exit", "Error"]));
    for status in statuses {
        let state = Cell::new(status.state());
        let state = if status.has_exception() {
            state.fg(Color::Red)
        } else if status.is_done() {
            state.fg(Color::Green)
        } else {
            state
        };
        table.add_row(vec![
            Cell::new(status.job_id()),
            state,
            Cell::new(if status.is_done() { "yes" } else { "no" }),
            Cell::new(
                status
                    .exit_code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(
                status
                    .failure()
                    .map(|f| f.to_string())
                    .unwrap_or_default(),
            )
            .fg(Color::DarkGrey),
        ]);
    }
    println!("{}", table);
    Ok(())
}
