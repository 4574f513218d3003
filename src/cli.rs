use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "mole keeps your tunnel definitions in sync with a mole server", long_about = None)]
pub(crate) struct MoleCli {
    /// display debug information
    #[arg(short, long, global = true)]
    pub debug: bool,
    /// mole directory, defaults to ~/.mole
    #[arg(long, env = "MOLE_HOME", global = true)]
    pub home: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub(crate) enum Command {
    /// list available tunnel definitions
    #[command(alias = "ls")]
    List {
        /// list what the server has instead of the local cache
        #[arg(short, long)]
        remote: bool,
    },
    /// get new and updated tunnel definitions from the server
    Pull,
    /// send a tunnel definition to the server
    Push { file: PathBuf },
    /// register with a mole server
    Register {
        server: String,
        token: String,
        /// server port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// generate a new registration token
    #[command(name = "gettoken")]
    GetToken,
    /// create a new user
    #[command(name = "newuser")]
    NewUser { username: String },
    /// delete a tunnel definition from the server
    Rm { tunnel: String },
    /// show tunnel definition
    View { tunnel: String },
    /// export tunnel definition to a file
    Export { tunnel: String, outfile: PathBuf },
}
