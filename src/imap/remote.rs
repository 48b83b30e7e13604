use async_imap::types::Fetch;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{pin_mut, StreamExt, TryStreamExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{ImapSession, MailRemote};
use crate::errors::{AppError, AppResult};
use crate::sanitize::decode_mime_header;
use crate::sync::Progress;
use crate::types::{Address, Flag, FolderInfo, Message, MessageHeader, UidRange};

const HEADER_QUERY: &str = "(UID FLAGS INTERNALDATE ENVELOPE)";
const SOURCE_QUERY: &str = "(UID BODY.PEEK[])";

/// `MailRemote` over a live async-imap session. Remembers the selected
/// folder so repeated calls do not re-SELECT.
pub struct ImapRemote {
    session: ImapSession,
    selected: Option<String>,
}

impl ImapRemote {
    pub fn new(session: ImapSession) -> Self {
        Self {
            session,
            selected: None,
        }
    }

    async fn ensure_selected(&mut self, folder: &str) -> AppResult<()> {
        if self.selected.as_deref() == Some(folder) {
            return Ok(());
        }
        self.session
            .select(folder)
            .await
            .map_err(|e| imap_err(&format!("SELECT {folder}"), e))?;
        self.selected = Some(folder.to_string());
        Ok(())
    }
}

#[async_trait]
impl MailRemote for ImapRemote {
    async fn folder_info(&mut self, folder: &str) -> AppResult<FolderInfo> {
        let mailbox = self
            .session
            .status(folder, "(MESSAGES UIDNEXT UNSEEN)")
            .await
            .map_err(|e| imap_err(&format!("STATUS {folder}"), e))?;
        let uid_next = mailbox
            .uid_next
            .ok_or_else(|| AppError::Protocol(format!("STATUS {folder} returned no UIDNEXT")))?;
        Ok(FolderInfo {
            uid_next,
            message_count: mailbox.exists,
            unseen: mailbox.unseen,
        })
    }

    async fn fetch_uids(
        &mut self,
        folder: &str,
        range: UidRange,
        progress: &watch::Sender<Progress>,
    ) -> AppResult<Vec<Message>> {
        self.ensure_selected(folder).await?;
        let uid_seq = range.to_sequence_set();
        debug!(folder = %folder, uid_seq = %uid_seq, "UID FETCH headers");

        let stream = self
            .session
            .uid_fetch(&uid_seq, HEADER_QUERY)
            .await
            .map_err(|e| imap_err("UID FETCH", e))?;
        pin_mut!(stream);

        let mut out = Vec::new();
        // A partial batch would move the sync cursor past the missing UIDs.
        while let Some(fetch_result) = stream.next().await {
            let fetch = fetch_result.map_err(|e| imap_err("UID FETCH", e))?;
            if let Some(msg) = message_from_fetch(&fetch) {
                out.push(msg);
                progress.send_modify(|p| p.fetched += 1);
            }
        }
        Ok(out)
    }

    async fn fetch_numbers(&mut self, folder: &str, range: UidRange) -> AppResult<Vec<Message>> {
        self.ensure_selected(folder).await?;
        let stream = self
            .session
            .fetch(range.to_sequence_set(), HEADER_QUERY)
            .await
            .map_err(|e| imap_err("FETCH", e))?;
        pin_mut!(stream);

        let mut out = Vec::new();
        while let Some(fetch_result) = stream.next().await {
            let fetch = fetch_result.map_err(|e| imap_err("FETCH", e))?;
            out.extend(message_from_fetch(&fetch));
        }
        Ok(out)
    }

    async fn fetch_source(&mut self, folder: &str, uid: u32) -> AppResult<Option<Vec<u8>>> {
        self.ensure_selected(folder).await?;
        let stream = self
            .session
            .uid_fetch(uid.to_string(), SOURCE_QUERY)
            .await
            .map_err(|e| imap_err("UID FETCH body", e))?;
        pin_mut!(stream);

        while let Some(fetch_result) = stream.next().await {
            let fetch = fetch_result.map_err(|e| imap_err("UID FETCH body", e))?;
            if fetch.uid == Some(uid) {
                return Ok(fetch.body().map(|b| b.to_vec()));
            }
        }
        Ok(None)
    }

    async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        let stream = self
            .session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| imap_err("LIST", e))?;
        pin_mut!(stream);

        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(name) => out.push(name.name().to_string()),
                Err(e) => warn!(error = %e, "Skipping unreadable LIST entry"),
            }
        }
        Ok(out)
    }

    async fn add_flags(&mut self, folder: &str, uid: u32, flags: &[Flag]) -> AppResult<()> {
        self.ensure_selected(folder).await?;
        let query = store_query(flags);
        let updates: Vec<Fetch> = self
            .session
            .uid_store(uid.to_string(), &query)
            .await
            .map_err(|e| imap_err("UID STORE", e))?
            .try_collect()
            .await
            .map_err(|e| imap_err("UID STORE", e))?;
        debug!(folder = %folder, uid, updates = updates.len(), query = %query, "Flags stored");
        Ok(())
    }

    async fn move_message(&mut self, folder: &str, uid: u32, dest: &str) -> AppResult<()> {
        self.ensure_selected(folder).await?;
        match self.session.uid_mv(uid.to_string(), dest).await {
            Ok(()) => Ok(()),
            Err(e @ async_imap::error::Error::No(_)) | Err(e @ async_imap::error::Error::Bad(_)) => {
                // Servers without MOVE: copy, then flag the original deleted.
                warn!(error = %e, "UID MOVE refused; falling back to COPY + \\Deleted");
                self.session
                    .uid_copy(uid.to_string(), dest)
                    .await
                    .map_err(|e| imap_err("UID COPY", e))?;
                self.add_flags(folder, uid, &[Flag::Deleted]).await
            }
            Err(e) => Err(imap_err("UID MOVE", e)),
        }
    }

    async fn logout(&mut self) -> AppResult<()> {
        self.selected = None;
        self.session
            .logout()
            .await
            .map_err(|e| imap_err("LOGOUT", e))
    }
}

fn imap_err(op: &str, err: async_imap::error::Error) -> AppError {
    use async_imap::error::Error;
    match err {
        Error::No(msg) | Error::Bad(msg) => AppError::Protocol(format!("{op}: {msg}")),
        other => AppError::Network(format!("{op}: {other}")),
    }
}

fn store_query(flags: &[Flag]) -> String {
    let names: Vec<String> = flags.iter().map(Flag::as_imap).collect();
    format!("+FLAGS ({})", names.join(" "))
}

pub(crate) fn convert_flag(flag: async_imap::types::Flag<'_>) -> Option<Flag> {
    use async_imap::types::Flag as ImapFlag;
    match flag {
        ImapFlag::Seen => Some(Flag::Seen),
        ImapFlag::Answered => Some(Flag::Answered),
        ImapFlag::Flagged => Some(Flag::Flagged),
        ImapFlag::Deleted => Some(Flag::Deleted),
        ImapFlag::Draft => Some(Flag::Draft),
        ImapFlag::Recent => Some(Flag::Recent),
        ImapFlag::MayCreate => None,
        ImapFlag::Custom(name) => Some(Flag::Custom(name.into_owned())),
    }
}

fn address_from(name: Option<&[u8]>, mailbox: Option<&[u8]>, host: Option<&[u8]>) -> Option<Address> {
    let local = std::str::from_utf8(mailbox?).ok()?;
    let mailbox = match host.and_then(|h| std::str::from_utf8(h).ok()) {
        Some(host) if !host.is_empty() => format!("{local}@{host}"),
        _ => local.to_string(),
    };
    let name = name
        .and_then(|n| std::str::from_utf8(n).ok())
        .map(|n| decode_mime_header(n).unwrap_or_else(|| n.to_string()));
    Some(Address { name, mailbox })
}

fn message_from_fetch(fetch: &Fetch) -> Option<Message> {
    let uid = fetch.uid?;
    let flags = fetch.flags().filter_map(convert_flag).collect();

    let mut header = MessageHeader {
        date: fetch.internal_date().map(|dt| dt.with_timezone(&Utc)),
        ..MessageHeader::default()
    };

    if let Some(env) = fetch.envelope() {
        header.subject = env
            .subject
            .as_deref()
            .and_then(|s| std::str::from_utf8(s).ok())
            .map(|s| decode_mime_header(s).unwrap_or_else(|| s.to_string()));
        header.sender = env.from.iter().flatten().find_map(|a| {
            address_from(a.name.as_deref(), a.mailbox.as_deref(), a.host.as_deref())
        });
        header.to = env
            .to
            .iter()
            .flatten()
            .filter_map(|a| address_from(a.name.as_deref(), a.mailbox.as_deref(), a.host.as_deref()))
            .collect();
        header.cc = env
            .cc
            .iter()
            .flatten()
            .filter_map(|a| address_from(a.name.as_deref(), a.mailbox.as_deref(), a.host.as_deref()))
            .collect();
        if header.date.is_none() {
            header.date = env
                .date
                .as_deref()
                .and_then(|d| std::str::from_utf8(d).ok())
                .and_then(parse_rfc2822_date);
        }
    }

    Some(Message {
        uid,
        flags,
        header,
        body: None,
    })
}

fn parse_rfc2822_date(raw: &str) -> Option<DateTime<Utc>> {
    let ts = mailparse::dateparse(raw).ok()?;
    Utc.timestamp_opt(ts, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_imap::types::Flag as ImapFlag;
    use std::borrow::Cow;

    #[test]
    fn flags_map_to_local_set() {
        assert_eq!(convert_flag(ImapFlag::Seen), Some(Flag::Seen));
        assert_eq!(convert_flag(ImapFlag::Deleted), Some(Flag::Deleted));
        assert_eq!(convert_flag(ImapFlag::MayCreate), None);
        assert_eq!(
            convert_flag(ImapFlag::Custom(Cow::Borrowed("$Junk"))),
            Some(Flag::Custom("$Junk".into()))
        );
    }

    #[test]
    fn store_query_lists_every_flag() {
        assert_eq!(store_query(&[Flag::Seen]), "+FLAGS (\\Seen)");
        assert_eq!(
            store_query(&[Flag::Seen, Flag::Flagged]),
            "+FLAGS (\\Seen \\Flagged)"
        );
    }

    #[test]
    fn envelope_addresses_are_joined_and_decoded() {
        let addr = address_from(
            Some(b"=?UTF-8?Q?J=C3=B6rg?="),
            Some(b"joerg"),
            Some(b"example.org"),
        )
        .unwrap();
        assert_eq!(addr.mailbox, "joerg@example.org");
        assert_eq!(addr.name.as_deref(), Some("Jörg"));
        assert!(address_from(None, None, Some(b"x")).is_none());
    }

    #[test]
    fn envelope_dates_parse() {
        let dt = parse_rfc2822_date("Tue, 1 Jul 2003 10:52:37 +0200").unwrap();
        assert_eq!(dt.timestamp(), 1_057_049_557);
    }
}
