use std::process::exit;

use crate::interface::CatFile;
use crate::object::Object;
use crate::object_id::ObjectId;
use crate::repo::Repo;
use crate::Result;

/// Look `id` up in every source the database knows. Absent and unreadable objects both end the
/// process with status 1, the latter with the reason on stderr.
fn load_or_exit(repo: &Repo, id: &ObjectId) -> Object {
    match repo.database.resolve(id) {
        Ok(object) => object,
        Err(e) if e.is_not_found() => {
            eprintln!("Object does not exist: {id:x}");
            exit(1);
        }
        Err(e) => {
            eprintln!("Object is corrupt: {id:x}: {e}");
            exit(1);
        }
    }
}

pub fn handle(repo: &Repo, args: &CatFile) -> Result<()> {
    match args {
        CatFile::Exists { object } => {
            load_or_exit(repo, object);
        }
        CatFile::PrettyPrint { object } => load_or_exit(repo, object).pretty_print()?,
        CatFile::Type { object } => println!("{}", load_or_exit(repo, object).kind()),
        CatFile::Size { object } => println!("{}", load_or_exit(repo, object).data().len()),
    }
    Ok(())
}
