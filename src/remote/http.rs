use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use tracing::*;

use super::{FileStream, WalkRemoteObjectDatabase, INFO_ALTERNATES, INFO_HTTP_ALTERNATES};
use crate::error::{Error, Result};

/// A repository served as static files over HTTP.
///
/// Alternates opened from this remote share its [`Client`], and with it the connection pool.
/// Closing drops this remote's handle on the client; the pool goes once every sharer is closed.
#[derive(Debug)]
pub struct HttpRemote {
    base: Url,
    location: String,
    /// `None` once closed
    client: Option<Client>,
}

fn transport(e: impl std::fmt::Display) -> Error {
    Error::Transport(e.to_string())
}

/// Parse `url` as a directory, i.e. with a trailing `/` so that joins stay beneath it.
fn directory_url(url: &str) -> Result<Url> {
    let mut url = Url::parse(url).map_err(|e| transport(format!("invalid url {url}: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl HttpRemote {
    /// Connect to a repository URL. Both `.../repo.git` and `.../repo.git/objects` are accepted.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("rit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;
        let mut base = directory_url(url)?;
        if !base.path().ends_with("/objects/") {
            base = base.join("objects/").map_err(transport)?;
        }
        Ok(Self::with_client(base, client))
    }

    fn with_client(base: Url, client: Client) -> Self {
        debug!(%base, "Connected to http remote");
        Self {
            location: base.to_string(),
            base,
            client: Some(client),
        }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(transport)
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| transport(format!("{} is closed", self.location)))
    }
}

impl WalkRemoteObjectDatabase for HttpRemote {
    fn location(&self) -> &str {
        &self.location
    }

    fn pack_names(&self) -> Result<Vec<String>> {
        // There is no directory listing over http
        Ok(super::read_info_packs(self)?.unwrap_or_default())
    }

    fn alternates(&self) -> Result<Vec<String>> {
        let alternates = super::read_alternates(self, INFO_HTTP_ALTERNATES)?;
        if !alternates.is_empty() {
            return Ok(alternates);
        }
        super::read_alternates(self, INFO_ALTERNATES)
    }

    fn open(&self, path: &str) -> Result<FileStream> {
        let client = self.client()?;
        let url = self.url(path)?;
        trace!(%url, "GET");
        let response = client.get(url.clone()).send().map_err(transport)?;
        match response.status() {
            status if status.is_success() => {
                let length = response.content_length();
                Ok(FileStream::new(response, length))
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(Error::NotFound(url.to_string())),
            status => Err(transport(format!("GET {url}: {status}"))),
        }
    }

    fn open_alternate(&self, location: &str) -> Result<Box<dyn WalkRemoteObjectDatabase>> {
        let client = self.client()?.clone();
        let base = self.url(location)?;
        Ok(Box::new(HttpRemote::with_client(base, client)))
    }

    fn close(&mut self) {
        if self.client.take().is_some() {
            trace!(location = %self.location, "Closing http remote");
        }
    }
}
