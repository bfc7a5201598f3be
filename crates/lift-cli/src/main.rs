//! lift: command-line client for the elevation broker.
//!
//! `cred` authenticates and prints the session grant, `bless` asks the
//! broker to elevate a file descriptor, and `record` produces a
//! credentials-file line for operators provisioning the broker.

use std::io::{BufRead, Read, Write};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lift_proto::client::{Client, Reply};
use lift_proto::{AccessRights, ResponseTag};
use rand::RngCore;

/// lift - talk to the local elevation broker
#[derive(Parser, Debug)]
#[command(name = "lift")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Broker socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate and print the session grant
    Cred {
        /// Username
        user: String,

        /// Password (prompted on stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Have a file's descriptor blessed with elevated rights
    Bless {
        /// File whose descriptor should be blessed
        file: PathBuf,

        /// Request write access as well
        #[arg(long)]
        write: bool,

        /// Username to authenticate with first
        #[arg(long)]
        user: String,

        /// Password (prompted on stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Produce a credentials-file record
    Record {
        /// Username
        user: String,

        /// Password (prompted on stdin when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Salt in hex (random when omitted)
        #[arg(long)]
        salt: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Cred { user, password } => {
            let password = resolve_password(password)?;
            let mut client = connect(cli.socket.as_deref())?;
            let reply = client
                .authenticate(&user, &password)
                .context("credential request failed")?;
            if reply.tag == ResponseTag::Success {
                println!("{}", reply.tag);
                if let Some(fd) = reply.fd {
                    let mut grant = String::new();
                    std::fs::File::from(fd)
                        .read_to_string(&mut grant)
                        .context("failed to read session token")?;
                    print!("{grant}");
                }
            } else {
                report(&reply);
            }
            Ok(exit_code(reply.tag))
        }

        Command::Bless {
            file,
            write,
            user,
            password,
        } => {
            let password = resolve_password(password)?;
            let rights = if write {
                AccessRights::READ_WRITE
            } else {
                AccessRights::READ
            };

            let mut client = connect(cli.socket.as_deref())?;
            let auth = client
                .authenticate(&user, &password)
                .context("credential request failed")?;
            if auth.tag != ResponseTag::Success {
                report(&auth);
                return Ok(exit_code(auth.tag));
            }

            let handle = std::fs::File::open(&file)
                .with_context(|| format!("failed to open {}", file.display()))?;
            let reply = client
                .bless(handle.as_fd(), rights)
                .context("bless request failed")?;
            report(&reply);
            if reply.fd.is_some() {
                println!("blessed descriptor received ({rights})");
            }
            Ok(exit_code(reply.tag))
        }

        Command::Record {
            user,
            password,
            salt,
        } => {
            let password = resolve_password(password)?;
            let salt = match salt {
                Some(hex_salt) => hex::decode(&hex_salt).context("salt is not valid hex")?,
                None => {
                    let mut salt = vec![0u8; 16];
                    rand::thread_rng().fill_bytes(&mut salt);
                    salt
                }
            };
            println!("{}", liftd::auth::encode_record(&user, &salt, &password));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn connect(socket: Option<&std::path::Path>) -> Result<Client> {
    let path = socket.map_or_else(liftd::config::default_socket_path, PathBuf::from);
    Client::connect(&path).with_context(|| format!("failed to connect to {}", path.display()))
}

fn resolve_password(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    eprint!("password: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn report(reply: &Reply) {
    let detail = reply.detail();
    if detail.is_empty() {
        println!("{}", reply.tag);
    } else {
        println!("{}: {detail}", reply.tag);
    }
}

fn exit_code(tag: ResponseTag) -> ExitCode {
    match tag {
        ResponseTag::Success => ExitCode::SUCCESS,
        ResponseTag::AccessDenied => ExitCode::from(2),
        ResponseTag::InvalidMessage => ExitCode::from(3),
        ResponseTag::InternalError => ExitCode::from(4),
    }
}
