//! CLI tool for JPK archive operations.

mod commands;
mod exit_codes;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// JPK archive tool
#[derive(Parser)]
#[command(name = "jpk")]
#[command(author, about = "JPK archive tool", long_about = None)]
// No built-in version flag: its -V short belongs to --verify here.
#[command(disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PipelineFlags {
    /// Gzip entry payloads
    #[arg(short = 'z', long)]
    gzip: bool,

    /// Encrypt entry payloads and keys
    #[arg(short = 'e', long = "encrypt")]
    encrypt: bool,

    /// Append per-entry HMAC tags
    #[arg(short = 'H', long)]
    hmac: bool,

    /// Write a meta HMAC header after adding
    #[arg(short = 'M', long = "meta-hmac")]
    meta_hmac: bool,

    /// Encryption key (prompted for when encrypting without one)
    #[arg(short = 'k', long = "encryption-key")]
    encryption_key: Option<String>,

    /// Key prefix prepended to every added entry
    #[arg(long, default_value = "")]
    prefix: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new archive (alias: c)
    #[command(alias = "c")]
    Create {
        /// Archive file to create
        archive: PathBuf,

        /// Files and directories to add
        files: Vec<PathBuf>,

        #[command(flatten)]
        pipeline: PipelineFlags,
    },

    /// Add entries to an existing archive (alias: a)
    #[command(alias = "a")]
    Add {
        /// Archive file to extend
        archive: PathBuf,

        /// Files and directories to add
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        pipeline: PipelineFlags,
    },

    /// Extract archive contents (alias: x)
    #[command(alias = "x")]
    Extract {
        /// Archive file to extract
        archive: PathBuf,

        /// Output directory
        #[arg(short = 'o', long, default_value = ".")]
        output: PathBuf,

        /// Verify the meta HMAC and per-entry HMACs
        #[arg(short = 'V', long)]
        verify: bool,

        /// Encryption key
        #[arg(short = 'k', long = "encryption-key")]
        encryption_key: Option<String>,
    },

    /// List archive entries (alias: l)
    #[command(alias = "l")]
    List {
        /// Archive file to list
        archive: PathBuf,

        /// Verify the meta HMAC while loading
        #[arg(short = 'V', long)]
        verify: bool,

        /// Encryption key
        #[arg(short = 'k', long = "encryption-key")]
        encryption_key: Option<String>,

        /// Include directory entries
        #[arg(long = "directories", alias = "dir")]
        directories: bool,

        /// Show offsets, sizes, modes and flags
        #[arg(long)]
        technical: bool,
    },

    /// List archive headers (alias: lh)
    #[command(alias = "lh")]
    ListHeaders {
        /// Archive file to inspect
        archive: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Create {
            archive,
            files,
            pipeline,
        } => commands::create(&commands::WriteConfig {
            archive: &archive,
            files: &files,
            prefix: &pipeline.prefix,
            gzip: pipeline.gzip,
            encrypt: pipeline.encrypt,
            hmac: pipeline.hmac,
            meta_hmac: pipeline.meta_hmac,
            encryption_key: pipeline.encryption_key,
        }),

        Commands::Add {
            archive,
            files,
            pipeline,
        } => commands::add(&commands::WriteConfig {
            archive: &archive,
            files: &files,
            prefix: &pipeline.prefix,
            gzip: pipeline.gzip,
            encrypt: pipeline.encrypt,
            hmac: pipeline.hmac,
            meta_hmac: pipeline.meta_hmac,
            encryption_key: pipeline.encryption_key,
        }),

        Commands::Extract {
            archive,
            output,
            verify,
            encryption_key,
        } => commands::extract(&archive, &output, verify, encryption_key),

        Commands::List {
            archive,
            verify,
            encryption_key,
            directories,
            technical,
        } => commands::list(&archive, verify, encryption_key, directories, technical),

        Commands::ListHeaders { archive } => commands::list_headers(&archive),
    };

    std::process::exit(exit_code);
}
