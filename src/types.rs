use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub email: String,
    pub name: String,
    pub description: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn new(email: impl Into<String>) -> Self {
        let now = now_ts();
        Self {
            email: email.into(),
            name: String::new(),
            description: String::new(),
            last_updated: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// IMAP system flags plus server keywords.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
    Custom(String),
}

impl Flag {
    /// Wire form used in STORE commands.
    pub fn as_imap(&self) -> String {
        match self {
            Flag::Seen => "\\Seen".into(),
            Flag::Answered => "\\Answered".into(),
            Flag::Flagged => "\\Flagged".into(),
            Flag::Deleted => "\\Deleted".into(),
            Flag::Draft => "\\Draft".into(),
            Flag::Recent => "\\Recent".into(),
            Flag::Custom(name) => name.clone(),
        }
    }
}

pub type FlagSet = BTreeSet<Flag>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: String,
}

impl Address {
    pub fn new(mailbox: impl Into<String>) -> Self {
        Self {
            name: None,
            mailbox: mailbox.into(),
        }
    }

    /// Display name when the sender set one, otherwise the bare mailbox.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.mailbox,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => write!(f, "{} <{}>", name, self.mailbox),
            _ => f.write_str(&self.mailbox),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sender: Option<Address>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub uid: u32,
    pub flags: FlagSet,
    pub header: MessageHeader,
    /// Plain-text rendering, filled in lazily when the message is opened.
    pub body: Option<String>,
}

impl Message {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            flags: FlagSet::new(),
            header: MessageHeader::default(),
            body: None,
        }
    }

    pub fn with_flags(mut self, flags: impl IntoIterator<Item = Flag>) -> Self {
        self.flags = flags.into_iter().collect();
        self
    }

    pub fn is_seen(&self) -> bool {
        self.flags.contains(&Flag::Seen)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(&Flag::Deleted)
    }

    pub fn subject(&self) -> &str {
        self.header.subject.as_deref().unwrap_or("(No Subject)")
    }

    pub fn sender_name(&self) -> &str {
        self.header
            .sender
            .as_ref()
            .map(Address::display_name)
            .unwrap_or("")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Folder {
    pub name: String,
    pub icon: String,
    pub path: String,
}

impl Folder {
    pub fn new(name: &str, icon: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            icon: icon.to_string(),
            path: path.to_string(),
        }
    }
}

pub const INBOX: &str = "INBOX";
pub const TRASH: &str = "[Gmail]/Trash";

/// The mailboxes every account starts with, in display order.
pub fn well_known_folders() -> Vec<Folder> {
    vec![
        Folder::new("Inbox", "inmbox", INBOX),
        Folder::new("Drafts", "draftsmbox", "[Gmail]/Drafts"),
        Folder::new("Sent Mail", "sentmbox", "[Gmail]/Sent Mail"),
        Folder::new("Trash", "trashmbox", TRASH),
    ]
}

/// Server-side snapshot of a folder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FolderInfo {
    pub uid_next: u32,
    pub message_count: u32,
    pub unseen: Option<u32>,
}

/// Inclusive UID range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UidRange {
    pub start: u32,
    pub end: u32,
}

impl UidRange {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn to_sequence_set(&self) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
