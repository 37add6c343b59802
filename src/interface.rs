use camino::Utf8PathBuf;
use clap::Parser;
use clap::Subcommand;

use crate::fetch::AlternatePolicy;
use crate::object::ObjectKind;
use crate::object_id::ObjectId;
use crate::window_cache::{DEFAULT_LIMIT, DEFAULT_WINDOW_SIZE};

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    Init,

    #[command(subcommand)]
    CatFile(CatFile),

    /// Compute the id of a file's content, optionally storing it
    HashObject {
        /// Write the object into the object database
        #[arg(short)]
        write: bool,

        #[arg(short = 't', long = "type", default_value_t = ObjectKind::Blob)]
        kind: ObjectKind,

        file: Utf8PathBuf,
    },

    /// Fetch objects from a repository served over a dumb transport (a path, or an http(s) URL)
    Fetch {
        #[arg(env = "RIT_FETCH_REMOTE")]
        remote: String,

        #[arg(required = true, value_name = "want")]
        wants: Vec<ObjectId>,

        /// Point this ref at the first want once the fetch succeeds
        #[arg(long)]
        update_ref: Option<String>,

        /// How to treat alternates reachable through more than one path (dedup or all)
        #[arg(long, env = "RIT_ALTERNATES", default_value_t = AlternatePolicy::Deduplicate)]
        alternates: AlternatePolicy,
    },

    /// Check the checksums and every object of a pack
    VerifyPack {
        pack: Utf8PathBuf,

        /// List each object after verification
        #[arg(short, long)]
        verbose: bool,
    },

    /// Pack everything reachable from the given objects, or every loose object if none are given
    PackObjects {
        #[arg(value_name = "object")]
        objects: Vec<ObjectId>,
    },

    /// Write objects/info/packs so the repository can be fetched over a dumb transport
    UpdateServerInfo,
}

#[derive(Clone, Debug, Subcommand)]
pub enum CatFile {
    /// Exit with status `ExitCode::SUCCESS` if `object` exists and is a valid object. If
    /// `object` is of an invalid format, exit with status `ExitCode::FAILURE`, and print an
    /// error to stderr.
    #[command(short_flag = 'e')]
    Exists {
        #[arg(value_name = "object")]
        object: ObjectId,
    },

    /// Pretty-print the contents of `object` based on its type
    #[command(short_flag = 'p')]
    PrettyPrint {
        #[arg(value_name = "object")]
        object: ObjectId,
    },

    /// Print the type of `object` to stdout
    #[command(short_flag = 't')]
    Type {
        #[arg(value_name = "object")]
        object: ObjectId,
    },

    /// Print the size of `object` to stdout
    #[command(short_flag = 's')]
    Size {
        #[arg(value_name = "object")]
        object: ObjectId,
    },
}

#[derive(Debug, Parser)]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,

    /// The path to be used.
    #[arg(short)]
    pub path: Option<Utf8PathBuf>,

    /// Bytes mapped per pack window
    #[arg(long, env = "RIT_WINDOW_SIZE", default_value_t = DEFAULT_WINDOW_SIZE, global = true)]
    pub window_size: usize,

    /// Total bytes of pack windows kept mapped
    #[arg(long, env = "RIT_WINDOW_CACHE_LIMIT", default_value_t = DEFAULT_LIMIT, global = true)]
    pub window_cache_limit: usize,
}
