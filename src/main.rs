#[cfg(test)]
mod test;

mod cancel;
mod cat_file;
mod error;
mod fetch;
mod filemode;
mod interface;
mod lock;
mod loose;
mod object;
mod object_id;
mod odb;
mod pack;
mod remote;
mod repo;
mod server_info;
mod util;
mod window_cache;

use color_eyre::eyre::Context;
pub use color_eyre::Result;

use crate::fetch::{FetchOptions, Progress};
use crate::interface::*;
use crate::pack::PackFile;
use crate::remote::{HttpRemote, LocalRemote, WalkRemoteObjectDatabase};
use crate::repo::Repo;
use crate::window_cache::WindowCacheConfig;

use camino::Utf8PathBuf;
use clap::Parser;
use once_cell::sync::Lazy;
use tracing_subscriber::prelude::*;

static ARGS: Lazy<Opt> = Lazy::new(Opt::parse);

fn open_remote(remote: &str) -> Result<Box<dyn WalkRemoteObjectDatabase>> {
    if remote.starts_with("http://") || remote.starts_with("https://") {
        return Ok(Box::new(HttpRemote::new(remote)?));
    }
    let path = remote.strip_prefix("file://").unwrap_or(remote);
    Ok(Box::new(
        LocalRemote::new(path).wrap_err(format!("Cannot open remote '{remote}'"))?,
    ))
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    Lazy::force(&ARGS);

    let path = match ARGS.path {
        Some(ref path) => path
            .canonicalize_utf8()
            .wrap_err(format!("Directory not found: '{}'", path))?,
        None => Utf8PathBuf::try_from(std::env::current_dir()?.canonicalize()?)?,
    };

    if matches!(ARGS.command, Command::Init) {
        Repo::init(&path)?;
        return Ok(());
    }

    let config = WindowCacheConfig {
        window_size: ARGS.window_size,
        limit: ARGS.window_cache_limit,
    };
    let repo = Repo::open(&path, config)?;

    match &ARGS.command {
        Command::Init => unreachable!(),
        Command::CatFile(args) => cat_file::handle(&repo, args)?,
        Command::HashObject { write, kind, file } => {
            let data = std::fs::read(file).wrap_err(format!("Cannot read '{file}'"))?;
            println!("{:x}", repo.hash_object(*kind, data, *write)?);
        }
        Command::Fetch {
            remote,
            wants,
            update_ref,
            alternates,
        } => {
            let options = FetchOptions {
                alternates: *alternates,
            };
            let result = repo.fetch(
                open_remote(remote)?,
                wants,
                options,
                update_ref.as_deref(),
                |event| match event {
                    Progress::AlternateOpened { location } => {
                        eprintln!("Using alternate {location}")
                    }
                    Progress::PackFetched { pack, objects } => {
                        eprintln!("Fetched {pack} ({objects} objects)")
                    }
                    Progress::LooseFetched { .. } | Progress::Walked { .. } => {}
                },
            )?;
            println!(
                "Fetched {} packs and {} loose objects; {} objects walked",
                result.packs.len(),
                result.loose.len(),
                result.objects
            );
        }
        Command::VerifyPack { pack, verbose } => {
            let pack = PackFile::open(pack, repo.database.cache().clone())?;
            pack.verify(&*repo.database)
                .wrap_err(format!("Verification of {} failed", pack.name()))?;
            if *verbose {
                for id in pack.index().ids() {
                    let object = pack.get(id, &*repo.database)?;
                    println!("{id} {} {}", object.kind(), object.data().len());
                }
            }
            println!("{}: ok", pack.path());
        }
        Command::PackObjects { objects } => {
            let tips = if objects.is_empty() {
                repo.database.loose().ids()?
            } else {
                objects.clone()
            };
            let (name, count) = repo.pack_objects(&tips)?;
            eprintln!("Wrote {count} objects");
            println!("{name}");
        }
        Command::UpdateServerInfo => {
            server_info::update(&repo.database)?;
        }
    }
    Ok(())
}
