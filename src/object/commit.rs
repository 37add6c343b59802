use std::fmt::Display;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::bytes::Regex;

use super::{Object, ObjectKind, ParseError};
use crate::object_id::ObjectId;

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Timestamp {
    unix: i64,
    offset: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::offset::Local::now();
        let unix = now.timestamp();
        let offset_minutes = i64::from(now.offset().local_minus_utc()) / 60;
        let offset = (offset_minutes / 60) * 100 + offset_minutes % 60;

        Self { unix, offset }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{:04}",
            self.unix,
            if self.offset.is_negative() { '-' } else { '+' },
            self.offset.abs()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    name: String,
    email: String,
    when: Timestamp,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when: Timestamp::now(),
        }
    }

    /// Parse the value of a signature header.
    ///
    /// ## Example
    /// `Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100`
    pub(super) fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        static REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^([^<]*?) ?<([^>]*)> (-?\d+) ([+-]\d+)$").unwrap());

        let groups = REGEX.captures(bytes).ok_or_else(|| {
            ParseError::new(format!(
                "invalid signature: {}",
                String::from_utf8_lossy(bytes)
            ))
        })?;

        let field = |i: usize| String::from_utf8_lossy(&groups[i]).into_owned();
        let number = |i: usize| {
            field(i)
                .parse::<i64>()
                .map_err(|e| ParseError::new(format!("invalid signature timestamp: {e}")))
        };

        Ok(Self {
            name: field(1),
            email: field(2),
            when: Timestamp {
                unix: number(3)?,
                offset: number(4)?,
            },
        })
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}> {}", self.name, self.email, self.when)
    }
}

#[derive(Debug, Clone)]
pub struct Commit {
    tree_id: ObjectId,
    parents: Vec<ObjectId>,
    author: Signature,
    committer: Signature,
    message: String,
}

impl Commit {
    pub fn new(
        tree_id: ObjectId,
        parents: Vec<ObjectId>,
        author: Signature,
        message: impl Into<String>,
    ) -> Self {
        let committer = author.clone();
        Self {
            tree_id,
            parents,
            author,
            committer,
            message: message.into(),
        }
    }

    pub fn tree_id(&self) -> &ObjectId {
        &self.tree_id
    }

    pub fn parents(&self) -> &[ObjectId] {
        self.parents.as_ref()
    }

    pub fn author(&self) -> &Signature {
        &self.author
    }

    pub fn message(&self) -> &str {
        self.message.as_ref()
    }

    pub fn to_object(&self) -> Object {
        let mut data = format!("tree {:x}\n", self.tree_id);
        for parent in &self.parents {
            data.push_str(&format!("parent {parent:x}\n"));
        }
        data.push_str(&format!("author {}\n", self.author));
        data.push_str(&format!("committer {}\n", self.committer));
        data.push('\n');
        data.push_str(&self.message);

        Object::new(ObjectKind::Commit, data.into_bytes())
    }

    /// Parse a decompressed commit payload.
    ///
    /// ## Example
    /// ```text
    /// tree 090c4c5dd61d2e84c832c4cd306b66bf2fabc1f5
    /// parent e6a49274aa0893ce2e2928589100387aee220c5b
    /// parent 14a9d8464caef987f3b5c3cf26f56db825459abd
    /// author Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100
    /// committer Jamie Quigley <jamie@quigley.xyz> 1658312219 +0100
    /// gpgsig -----BEGIN PGP SIGNATURE-----
    ///  ...
    ///  -----END PGP SIGNATURE-----
    ///
    /// Merge remote-tracking branch 'origin/renovate/clap-3.x' into develop
    /// ```
    ///
    /// Headers other than tree, parent, author and committer are skipped, including their
    /// space-prefixed continuation lines.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        static TREEID_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^tree ([[:xdigit:]]{40})$").unwrap());
        static PARENT_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^parent ([[:xdigit:]]{40})$").unwrap());

        let (headers, message) = match memchr::memmem::find(bytes, b"\n\n") {
            Some(idx) => (&bytes[..idx], &bytes[idx + 2..]),
            None => (bytes, &b""[..]),
        };
        let mut lines = headers.split(|b| *b == b'\n');

        let tree_id = {
            let line = lines
                .next()
                .ok_or_else(|| ParseError::new("commit is empty"))?;
            let groups = TREEID_REGEX
                .captures(line)
                .ok_or_else(|| ParseError::new("tree id not found"))?;
            parse_hex(&groups[1])?
        };

        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in lines {
            if let Some(groups) = PARENT_REGEX.captures(line) {
                parents.push(parse_hex(&groups[1])?);
            } else if let Some(rest) = line.strip_prefix(b"author ") {
                author = Some(Signature::parse(rest)?);
            } else if let Some(rest) = line.strip_prefix(b"committer ") {
                committer = Some(Signature::parse(rest)?);
            }
        }

        Ok(Self {
            tree_id,
            parents,
            author: author.ok_or_else(|| ParseError::new("commit has no author"))?,
            committer: committer.ok_or_else(|| ParseError::new("commit has no committer"))?,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}

pub(super) fn parse_hex(hex: &[u8]) -> Result<ObjectId, ParseError> {
    std::str::from_utf8(hex)
        .ok()
        .and_then(|hex| ObjectId::from_str(hex).ok())
        .ok_or_else(|| ParseError::new(format!("invalid id: {}", String::from_utf8_lossy(hex))))
}
