//! Inbound event routing: where hidden datagrams are dug out of carrier
//! traffic.
//!
//! Two sources run per club: the long-poll loop consumes platform push
//! events, and the storage watcher diffs the key-value space on a short
//! poll. Every extracted datagram passes the loopback filter before it
//! reaches a session's reorder queue.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::carrier::qr::QrError;
use crate::carrier::{CarrierError, Update, UpdateKind};
use crate::codec::{CodecError, Datagram};
use crate::config::ClubConfig;
use crate::handler::queue::QueueClosed;
use crate::runtime::{Engine, EngineError};
use crate::storage;

const STORAGE_POLL: Duration = Duration::from_millis(500);
const STORAGE_BACKOFF: Duration = Duration::from_secs(5);
const LONG_POLL_WAIT: u64 = 25;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("unsupported update")]
    Unsupported,

    #[error(transparent)]
    Carrier(#[from] CarrierError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Qr(#[from] QrError),

    #[error(transparent)]
    Queue(#[from] QueueClosed),
}

/// What a piece of carrier text turned out to be.
enum Decoded {
    /// Our own frame echoed back by the platform.
    Loopback,

    /// A peer's padding frame: authentic, but carries nothing.
    Padding(Datagram),

    /// A peer's live frame.
    Frame(Datagram),
}

impl Engine {
    /// Long-poll driver for one club. A fatal server fetch at startup is an
    /// engine error; mid-run failures are logged and retried.
    pub(crate) async fn run_long_poll(self: Arc<Self>, club: ClubConfig) -> Result<(), EngineError> {
        let mut server = self.carrier.long_poll_server(&club).await?;
        let mut ts = server.ts.clone();

        tracing::info!(club = %club.name, "long poll: listening");

        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                polled = self.carrier.long_poll(&club, &server, &ts, LONG_POLL_WAIT) => polled,
            };

            let batch = match polled {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(club = %club.name, err = %err, "long poll: listen");
                    continue;
                }
            };

            if batch.failed != 0 {
                tracing::debug!(club = %club.name, "long poll: refresh");

                match self.carrier.long_poll_server(&club).await {
                    Ok(fresh) => {
                        ts = fresh.ts.clone();
                        server = fresh;
                    }
                    Err(err) => {
                        tracing::error!(club = %club.name, err = %err, "long poll: refresh");
                    }
                }

                continue;
            }

            ts = batch.ts.clone();

            for upd in batch.updates {
                let engine = self.clone();
                let club = club.clone();

                tokio::spawn(async move {
                    let kind = upd.kind.clone();

                    if let Err(err) = engine.handle_update(&club, upd).await {
                        tracing::error!(kind, err = %err, "handler: update");
                    }
                });
            }
        }
    }

    /// Storage watcher for one club: poll the whole key space, surface
    /// changed values as synthetic storage events. Idles while no session
    /// is open.
    pub(crate) async fn run_storage_watch(
        self: Arc<Self>,
        club: ClubConfig,
    ) -> Result<(), EngineError> {
        let keys = storage::watch_keys();
        let mut last = self.carrier.storage_get(&club, &keys).await?;

        tracing::info!(club = %club.name, "storage: listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(STORAGE_POLL) => {}
            }

            if !self.sessions.any_open() {
                continue;
            }

            let current = match self.carrier.storage_get(&club, &keys).await {
                Ok(current) => current,
                Err(err) => {
                    tracing::error!(club = %club.name, err = %err, "storage: listen");

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(STORAGE_BACKOFF) => {}
                    }

                    continue;
                }
            };

            let changed = storage::diff_values(&last, &current);
            last = current;

            for entry in changed {
                let engine = self.clone();
                let club = club.clone();

                tokio::spawn(async move {
                    if let Err(err) = engine.handle_storage_value(&entry.value).await {
                        tracing::error!(club = %club.name, err = %err, "storage: update");
                    }
                });
            }
        }
    }

    async fn handle_update(&self, club: &ClubConfig, upd: Update) -> Result<(), UpdateError> {
        match upd.kind() {
            UpdateKind::MessageReply
            | UpdateKind::WallPostNew
            | UpdateKind::WallReplyNew
            | UpdateKind::StorageChange => self.handle_text(&upd.object.text).await,
            UpdateKind::PhotoNew => {
                if !self.should_handle_photo(&upd.object.text) {
                    return Ok(());
                }

                let datagrams = self.handle_photo(&upd.object.orig_photo.url).await?;

                for dg in datagrams {
                    tracing::debug!(kind = %upd.kind, dg = %dg, "handler: update");
                    self.dispatch_datagram(dg)?;
                }

                Ok(())
            }
            UpdateKind::GroupChangeSettings => {
                let url = &upd.object.changes.website.new_value;

                if url.is_empty() {
                    return Err(UpdateError::Unsupported);
                }

                self.fetch_announced_doc(url).await
            }
            UpdateKind::Unsupported => Err(UpdateError::Unsupported),
        }
    }

    /// A text field either holds an encoded datagram directly or announces
    /// an uploaded document by URL.
    async fn handle_text(&self, text: &str) -> Result<(), UpdateError> {
        if text.is_empty() {
            return Ok(());
        }

        match self.classify(text) {
            Ok(Decoded::Frame(dg)) => {
                tracing::debug!(dg = %dg, "handler: update");
                self.dispatch_datagram(dg)?;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(decode_err) => match restore_doc_url(text) {
                Some(url) => self.fetch_announced_doc(&url).await,
                None => Err(decode_err.into()),
            },
        }
    }

    /// Probe an announced URL's caption tag, then download and decode the
    /// document body.
    async fn fetch_announced_doc(&self, url: &str) -> Result<(), UpdateError> {
        if !self.should_handle_doc(url) {
            return Ok(());
        }

        let body = self.carrier.download_url(&clear_doc_url(url)).await?;
        let text = String::from_utf8_lossy(&body);

        match self.classify(text.trim()) {
            Ok(Decoded::Frame(dg)) => {
                tracing::debug!(dg = %dg, "handler: doc");
                self.dispatch_datagram(dg)?;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_storage_value(&self, value: &str) -> Result<(), UpdateError> {
        if value.is_empty() {
            return Ok(());
        }

        match self.classify(value) {
            Ok(Decoded::Frame(dg)) => {
                self.storage.observe(dg.device);
                tracing::debug!(dg = %dg, "storage: update");
                self.dispatch_datagram(dg)?;
                Ok(())
            }
            Ok(Decoded::Padding(dg)) => {
                self.storage.observe(dg.device);
                Ok(())
            }
            Ok(Decoded::Loopback) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Download a photo, scan its QR grid and return the extracted frames
    /// ordered by sequence number.
    async fn handle_photo(&self, url: &str) -> Result<Vec<Datagram>, UpdateError> {
        let bytes = self.carrier.download_url(url).await?;

        let file = self.qr.save(&bytes, "jpg")?;
        let decoded = self.qr.decode(&file).await;
        let _ = std::fs::remove_file(&file);

        let mut datagrams = Vec::new();

        for content in decoded? {
            if let Decoded::Frame(dg) = self.classify(&content)? {
                datagrams.push(dg);
            }
        }

        datagrams.sort_by_key(|dg| dg.number);

        Ok(datagrams)
    }

    fn classify(&self, text: &str) -> Result<Decoded, CodecError> {
        let dg = Datagram::decode(text.trim())?;

        if dg.is_loopback(self.device) {
            return Ok(Decoded::Loopback);
        }

        if dg.is_zero() {
            return Ok(Decoded::Padding(dg));
        }

        Ok(Decoded::Frame(dg))
    }

    /// A photo whose caption is our own frame is our own upload; anything
    /// else (a peer frame, a doc URL, platform noise) is worth scanning.
    fn should_handle_photo(&self, caption: &str) -> bool {
        if caption.is_empty() {
            return true;
        }

        !matches!(self.classify(caption), Ok(Decoded::Loopback))
    }

    /// Same filter for announced URLs, read from the `caption` query tag.
    fn should_handle_doc(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return true;
        };

        let Some(caption) = parsed
            .query_pairs()
            .find(|(key, _)| key == "caption")
            .map(|(_, value)| value.into_owned())
        else {
            return true;
        };

        !matches!(self.classify(&caption), Ok(Decoded::Loopback))
    }
}

/// Strip the caption tag before downloading.
fn clear_doc_url(url: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };

    let remaining: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != "caption")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if remaining.is_empty() {
        parsed.set_query(None);
    } else {
        parsed
            .query_pairs_mut()
            .clear()
            .extend_pairs(remaining.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    parsed.to_string()
}

/// Announced URLs travel with their dots spaced out so carriers do not
/// linkify them; undo that before treating text as a URL.
fn restore_doc_url(text: &str) -> Option<String> {
    let restored = text.trim().replace(". ", ".");

    if restored.starts_with("http://") || restored.starts_with("https://") {
        return Some(restored);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Alphabet;

    #[test]
    fn restore_doc_url_undoes_dot_spacing() {
        let announced = "https://files. example. com/doc123?caption=abc";

        assert_eq!(
            restore_doc_url(announced).unwrap(),
            "https://files.example.com/doc123?caption=abc"
        );

        assert!(restore_doc_url("not a url").is_none());
        assert!(restore_doc_url(&Datagram::padding(1).encode(Alphabet::Ascii)).is_none());
    }

    #[test]
    fn clear_doc_url_strips_only_the_caption() {
        let url = "https://files.example.com/doc?caption=abc&key=1";
        let cleaned = clear_doc_url(url);

        assert!(!cleaned.contains("caption"));
        assert!(cleaned.contains("key=1"));

        let url = "https://files.example.com/doc?caption=abc";
        assert_eq!(clear_doc_url(url), "https://files.example.com/doc");
    }
}
