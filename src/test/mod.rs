
use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use camino::Utf8Path;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tempdir::TempDir;

use crate::cancel::CancelFlag;
use crate::error::{Error, Result};
use crate::filemode::FileMode;
use crate::object::commit::{Commit, Signature};
use crate::object::tree::{Tree, TreeEntry};
use crate::object::Object;
use crate::odb::ObjectDatabase;
use crate::pack::write::WrittenPack;
use crate::remote::{FileStream, WalkRemoteObjectDatabase, INFO_ALTERNATES, INFO_PACKS};
use crate::window_cache::{WindowCache, WindowCacheConfig};

pub const COMMIT_NAME: &str = "Jamie Quigley";
pub const COMMIT_EMAIL: &str = "jamie@quigley.xyz";

/// `C1 -> C0`, both with tree `T0` holding blob `B0`.
pub struct History {
    pub b0: Object,
    pub t0: Object,
    pub c0: Object,
    pub c1: Object,
}

impl History {
    pub fn new() -> Self {
        let b0 = Object::blob("file contents\n");
        let t0 = Tree::new(vec![TreeEntry::new(FileMode::REGULAR, "file", b0.id())]).to_object();
        let author = Signature::new(COMMIT_NAME, COMMIT_EMAIL);
        let c0 = Commit::new(t0.id(), vec![], author.clone(), "first\n").to_object();
        let c1 = Commit::new(t0.id(), vec![c0.id()], author, "second\n").to_object();
        Self { b0, t0, c0, c1 }
    }

    pub fn all(&self) -> [&Object; 4] {
        [&self.c1, &self.c0, &self.t0, &self.b0]
    }
}

pub fn local_db(tmp: &TempDir) -> Result<ObjectDatabase> {
    let objects = Utf8Path::from_path(tmp.path()).unwrap().join("objects");
    let cache = Arc::new(WindowCache::new(WindowCacheConfig::default()));
    ObjectDatabase::open(objects, cache)
}

pub fn loose_bytes(object: &Object) -> Vec<u8> {
    let mut e = ZlibEncoder::new(Vec::new(), Compression::default());
    e.write_all(&object.formatted()).unwrap();
    e.finish().unwrap()
}

#[derive(Default)]
struct ServerState {
    /// repo name -> path -> content
    repos: HashMap<String, HashMap<String, Vec<u8>>>,
    requests: Vec<String>,
    opened: Vec<String>,
    closed: Vec<String>,
    /// Served with a success status for every missing loose object
    lie: Option<Vec<u8>>,
    /// Cancelled when the first loose object is requested
    cancel_on_loose: Option<CancelFlag>,
    /// The first loose object request waits for a message on this
    gate: Option<Receiver<()>>,
}

/// Repositories held in memory, served the way a dumb server would serve them.
#[derive(Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn put_file(&self, repo: &str, path: &str, content: impl Into<Vec<u8>>) {
        self.state()
            .repos
            .entry(repo.to_owned())
            .or_default()
            .insert(path.to_owned(), content.into());
    }

    pub fn put_loose(&self, repo: &str, object: &Object) {
        self.put_file(repo, &object.id().loose_path(), loose_bytes(object));
    }

    pub fn put_pack(&self, repo: &str, pack: &WrittenPack) {
        self.put_file(repo, &format!("pack/{}.pack", pack.name), pack.pack.clone());
        self.put_file(repo, &format!("pack/{}.idx", pack.name), pack.index.clone());
        let mut state = self.state();
        let files = state.repos.entry(repo.to_owned()).or_default();
        let info = files.entry(INFO_PACKS.to_owned()).or_default();
        info.extend_from_slice(format!("P {}.pack\n", pack.name).as_bytes());
    }

    pub fn set_alternates(&self, repo: &str, alternates: &[&str]) {
        let mut text = alternates.join("\n");
        text.push('\n');
        self.put_file(repo, INFO_ALTERNATES, text);
    }

    pub fn lie_with(&self, content: impl Into<Vec<u8>>) {
        self.state().lie = Some(content.into());
    }

    pub fn cancel_on_loose_request(&self, cancel: CancelFlag) {
        self.state().cancel_on_loose = Some(cancel);
    }

    pub fn hold_first_loose_request(&self, gate: Receiver<()>) {
        self.state().gate = Some(gate);
    }

    pub fn connect(self: &Arc<Self>, repo: &str) -> Box<dyn WalkRemoteObjectDatabase> {
        self.state().opened.push(repo.to_owned());
        Box::new(MemoryRemote {
            server: self.clone(),
            repo: repo.to_owned(),
            location: format!("mem://{repo}/"),
            closed: false,
        })
    }

    /// Every path requested, as `repo:path`.
    pub fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }

    pub fn loose_requests(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| !r.contains(":info/") && !r.contains(":pack/"))
            .count()
    }

    pub fn pack_downloads(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.contains(":pack/") && r.ends_with(".pack"))
            .count()
    }

    pub fn opened(&self) -> Vec<String> {
        self.state().opened.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.state().closed.clone()
    }
}

struct MemoryRemote {
    server: Arc<MemoryServer>,
    repo: String,
    location: String,
    closed: bool,
}

impl WalkRemoteObjectDatabase for MemoryRemote {
    fn location(&self) -> &str {
        &self.location
    }

    fn pack_names(&self) -> Result<Vec<String>> {
        Ok(crate::remote::read_info_packs(self)?.unwrap_or_default())
    }

    fn alternates(&self) -> Result<Vec<String>> {
        crate::remote::read_alternates(self, INFO_ALTERNATES)
    }

    fn open(&self, path: &str) -> Result<FileStream> {
        assert!(!self.closed, "read from closed remote {}", self.repo);
        let mut state = self.server.state();
        state.requests.push(format!("{}:{path}", self.repo));
        let loose = !path.starts_with("info/") && !path.starts_with("pack/");
        if let (true, Some(cancel)) = (loose, &state.cancel_on_loose) {
            cancel.cancel();
        }
        let gate = if loose { state.gate.take() } else { None };
        let content = state
            .repos
            .get(&self.repo)
            .and_then(|files| files.get(path))
            .or(state.lie.as_ref().filter(|_| loose))
            .cloned();
        drop(state);
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        match content {
            Some(content) => Ok(FileStream::from_bytes(content)),
            None => Err(Error::NotFound(format!("{}:{path}", self.repo))),
        }
    }

    fn open_alternate(&self, location: &str) -> Result<Box<dyn WalkRemoteObjectDatabase>> {
        let repo = location
            .trim_start_matches("mem://")
            .trim_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        Ok(self.server.connect(repo))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.state().closed.push(self.repo.clone());
        }
    }
}
