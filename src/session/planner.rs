//! Carrier scheduling: which platform endpoint conveys which datagram.
//!
//! Control-plane frames and small FORWARDs ride a random "small" method;
//! big FORWARDs ride a document, split into freshly numbered fragments when
//! they exceed a single document's budget. The choice is randomised so the
//! traffic pattern stays uneven and rate limits spread across endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::mpsc;

use super::Session;
use crate::carrier::qr::{QrCodec, QrError};
use crate::carrier::{Carrier, CarrierError, GroupsEdit};
use crate::codec::{max_decoded_len, Alphabet, Command, Datagram, HEADER_ENCODED_LEN};
use crate::config::{ClubConfig, Config, UserConfig};
use crate::storage::StorageKeys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Message,
    Post,
    Comment,
    Doc,
    Qr,
    Storage,
    Description,
    Website,
    VideoComment,
    PhotoComment,
}

impl Method {
    /// Methods that need an authorised user token.
    pub fn user_scoped(self) -> bool {
        matches!(self, Method::Qr | Method::VideoComment | Method::PhotoComment)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub enabled: bool,
    pub alphabet: Alphabet,
    pub max_encoded: usize,
    pub max_payload: usize,
}

/// Static per-method budgets, computed once at engine init.
pub struct MethodTable {
    specs: std::collections::HashMap<Method, MethodSpec>,
}

impl MethodTable {
    pub fn new(cfg: &Config) -> Self {
        let user = !cfg.api.unathorized;
        let qr_max = QrCodec::level_capacity(cfg.qr.image_level);

        let entries = [
            (Method::Message, true, Alphabet::Wide, 4096),
            (Method::Post, true, Alphabet::Wide, 16_000),
            (Method::Comment, true, Alphabet::Wide, 16_000),
            (Method::Doc, true, Alphabet::Ascii, 1024 * 1024),
            (Method::Qr, user, Alphabet::Ascii, qr_max),
            (Method::Storage, true, Alphabet::Ascii, 4096),
            (Method::Description, true, Alphabet::Ascii, 2800),
            (Method::Website, true, Alphabet::Ascii, 175),
            (Method::VideoComment, user, Alphabet::Wide, 4096),
            (Method::PhotoComment, user, Alphabet::Wide, 2048),
        ];

        let specs = entries
            .into_iter()
            .map(|(method, enabled, alphabet, max_encoded)| {
                let spec = MethodSpec {
                    enabled,
                    alphabet,
                    max_encoded,
                    max_payload: max_decoded_len(max_encoded.saturating_sub(HEADER_ENCODED_LEN)),
                };
                (method, spec)
            })
            .collect();

        Self { specs }
    }

    pub fn spec(&self, method: Method) -> MethodSpec {
        self.specs[&method]
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no methods available for {0} encoded characters")]
    NoMethod(usize),

    #[error("fragment loop guard tripped")]
    LoopGuard,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Carrier(#[from] CarrierError),

    #[error(transparent)]
    Qr(#[from] QrError),

    #[error("no clubs configured")]
    NoClubs,

    #[error("no users configured")]
    NoUsers,

    #[error("no posts created")]
    NoPosts,
}

pub struct Planner {
    device: i64,
    cfg: Config,
    carrier: Arc<dyn Carrier>,
    qr: Arc<QrCodec>,
    storage: Arc<StorageKeys>,
    methods: MethodTable,
    user_methods_disabled: AtomicBool,
}

impl Planner {
    pub fn new(
        cfg: Config,
        device: i64,
        carrier: Arc<dyn Carrier>,
        qr: Arc<QrCodec>,
        storage: Arc<StorageKeys>,
    ) -> Self {
        let methods = MethodTable::new(&cfg);

        Self {
            device,
            cfg,
            carrier,
            qr,
            storage,
            methods,
            user_methods_disabled: AtomicBool::new(false),
        }
    }

    fn enabled(&self, method: Method) -> bool {
        if method.user_scoped() && self.user_methods_disabled.load(Ordering::SeqCst) {
            return false;
        }

        self.methods.spec(method).enabled
    }

    /// Outbound drainer: plans every queued datagram, records its fragments
    /// for RETRY and fires the carrier calls. Datagrams accepted before the
    /// close landed (a parting CLOSE in particular) are still flushed.
    pub async fn run(
        self: Arc<Self>,
        session: Arc<Session>,
        mut rx: mpsc::Receiver<Datagram>,
    ) {
        loop {
            let closed = session.closed();
            let dg = tokio::select! {
                biased;
                maybe = rx.recv() => match maybe {
                    Some(dg) => dg,
                    None => return,
                },
                _ = closed.cancelled() => break,
            };

            self.clone().handle_one(&session, dg);
        }

        while let Ok(dg) = rx.try_recv() {
            self.clone().handle_one(&session, dg);
        }
    }

    fn handle_one(self: Arc<Self>, session: &Arc<Session>, dg: Datagram) {
        let plan = match self.plan(session, dg) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(id = session.id(), err = %err, "session: plan");
                return;
            }
        };

        let fragments: Vec<Datagram> = plan.iter().map(|(_, fg)| fg.clone()).collect();
        session.record_history(&fragments);

        self.execute(session, plan);
    }

    /// Produce the (method, fragment) pairs conveying one datagram.
    pub fn plan(
        &self,
        session: &Session,
        mut dg: Datagram,
    ) -> Result<Vec<(Method, Datagram)>, PlanError> {
        let mut small = vec![Method::Message, Method::Post];

        for method in [Method::Qr, Method::VideoComment, Method::PhotoComment] {
            if self.enabled(method) {
                small.push(method);
            }
        }

        if session.has_posts() {
            small.push(Method::Comment);
            small.push(Method::Comment);
        }

        if dg.command != Command::Connect {
            small.push(Method::Storage);
            small.push(Method::Storage);
        }

        let big = [Method::Doc];

        // Budgets of the two tightest carriers cap what still counts as a
        // "small" frame, whether or not those carriers are enabled.
        let max_small = self
            .methods
            .spec(Method::Qr)
            .max_encoded
            .min(self.methods.spec(Method::PhotoComment).max_encoded);

        if dg.command != Command::Forward || dg.encoded_len() <= max_small {
            if dg.number == 0 {
                dg.number = session.next_number();
            }

            let method = *choose(&small);

            return Ok(vec![(method, dg)]);
        }

        if dg.number != 0 {
            let available: Vec<Method> = big
                .iter()
                .copied()
                .filter(|m| dg.encoded_len() <= self.methods.spec(*m).max_encoded)
                .collect();

            if available.is_empty() {
                return Err(PlanError::NoMethod(dg.encoded_len()));
            }

            return Ok(vec![(*choose(&available), dg)]);
        }

        let mut plan = Vec::new();
        let mut payload = std::mem::take(&mut dg.payload);

        while !payload.is_empty() {
            let method = *choose(&big);
            let take = self.methods.spec(method).max_payload.min(payload.len());
            let rest = payload.split_off(take);

            let number = session.next_number();
            let fragment = Datagram::new(self.device, dg.session, number, dg.command, payload);
            payload = rest;

            plan.push((method, fragment));

            if plan.len() > 1000 {
                return Err(PlanError::LoopGuard);
            }
        }

        Ok(plan)
    }

    /// Fire one carrier call per fragment, each in its own subtask. QR
    /// fragments are pooled into a single grid photo.
    fn execute(self: Arc<Self>, session: &Arc<Session>, plan: Vec<(Method, Datagram)>) {
        let mut qr_batch = Vec::new();

        for (method, fragment) in plan {
            if method == Method::Qr {
                tracing::debug!(id = session.id(), ?method, dg = %fragment, "session: send");
                qr_batch.push(fragment.encode(self.methods.spec(Method::Qr).alphabet));
                continue;
            }

            let encoded = fragment.encode(self.methods.spec(method).alphabet);
            tracing::debug!(id = session.id(), ?method, dg = %fragment, "session: send");

            let planner = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(err) = planner.run_method(&session, method, encoded).await {
                    tracing::error!(id = session.id(), ?method, err = %err, "session: send");
                }
            });
        }

        if !qr_batch.is_empty() {
            let planner = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(err) = planner.send_qr(qr_batch, None).await {
                    planner.note_user_error(Method::Qr, &err);
                    tracing::error!(id = session.id(), err = %err, "session: send qr");
                }
            });
        }
    }

    async fn run_method(
        &self,
        session: &Arc<Session>,
        method: Method,
        encoded: String,
    ) -> Result<(), ExecError> {
        let result = self.dispatch(session, method, encoded).await;

        if let Err(err) = &result {
            self.note_user_error(method, err);
        }

        result
    }

    /// An unauthorised answer on a user-scoped method disables those
    /// methods for the rest of the run.
    fn note_user_error(&self, method: Method, err: &ExecError) {
        let ExecError::Carrier(carrier_err) = err else {
            return;
        };

        if method.user_scoped() && carrier_err.is_unauthorized() {
            if !self.user_methods_disabled.swap(true, Ordering::SeqCst) {
                tracing::warn!(?method, "carrier: user methods disabled");
            }
        }
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        method: Method,
        text: String,
    ) -> Result<(), ExecError> {
        match method {
            Method::Message => {
                let (club, user) = (self.random_club()?, self.random_user()?);
                self.carrier.send_message(club, user, &text).await?;
            }
            Method::Post => {
                let club = self.random_club()?;
                let post_id = self.carrier.wall_post(club, &text).await?;
                session.set_post(&club.id, post_id);
            }
            Method::Comment => {
                let posts = session.posts();
                let (club_id, post_id) = posts.choose(&mut rand::thread_rng()).ok_or(ExecError::NoPosts)?;
                let club = self.club_by_id(club_id)?;
                self.carrier.wall_comment(club, *post_id, &text).await?;
            }
            Method::Doc => {
                self.send_doc(session, text).await?;
            }
            Method::Qr => {
                self.send_qr(vec![text], None).await?;
            }
            Method::Storage => {
                let club = self.random_club()?;
                let key = self.storage.next_set_key();
                self.carrier.storage_set(club, &key, &text).await?;
            }
            Method::Description => {
                let club = self.random_club()?;
                let edit = GroupsEdit {
                    description: Some(text),
                    ..GroupsEdit::default()
                };
                self.carrier.groups_edit(club, edit).await?;
            }
            Method::Website => {
                let club = self.random_club()?;
                let edit = GroupsEdit {
                    website: Some(text),
                    ..GroupsEdit::default()
                };
                self.carrier.groups_edit(club, edit).await?;
            }
            Method::VideoComment => {
                let (club, user) = (self.random_club()?, self.random_user()?);
                self.carrier.video_comment(club, user, &text).await?;
            }
            Method::PhotoComment => {
                let (club, user) = (self.random_club()?, self.random_user()?);
                self.carrier.photo_comment(club, user, &text).await?;
            }
        }

        Ok(())
    }

    /// Two-phase document delivery: upload the blob, then announce its URL
    /// via another random method. The URL gets a padding caption as an
    /// authenticity tag and its dots spaced out so carriers do not render
    /// it as a link.
    async fn send_doc(&self, session: &Arc<Session>, encoded: String) -> Result<(), ExecError> {
        let club = self.random_club()?;
        let doc = self.carrier.docs_upload(club, encoded.into_bytes()).await?;

        let zero = Datagram::padding(self.device).encode(Alphabet::Ascii);
        let tag: String = url::form_urlencoded::byte_serialize(zero.as_bytes()).collect();

        let separator = if doc.url.contains('?') { '&' } else { '?' };
        let uri = format!("{}{}caption={}", doc.url, separator, tag);
        let message = uri.replace('.', ". ");

        let mut pool = vec![
            Method::Message,
            Method::Post,
            Method::Storage,
            Method::Storage,
            Method::Description,
            Method::Website,
        ];

        for method in [Method::Qr, Method::VideoComment, Method::PhotoComment] {
            if self.enabled(method) {
                pool.push(method);
            }
        }

        if session.has_posts() {
            pool.push(Method::Comment);
            pool.push(Method::Comment);
        }

        let method = *choose(&pool);
        tracing::debug!(id = session.id(), ?method, "session: announce doc");

        if method == Method::Qr {
            let zero_tile = Datagram::padding(self.device).encode(Alphabet::Ascii);
            self.send_qr(vec![zero_tile], Some(message)).await
        } else {
            Box::pin(self.dispatch(session, method, message)).await
        }
    }

    /// Render each encoded fragment as a QR tile, merge the tiles into one
    /// grid image and upload it as a single photo.
    async fn send_qr(&self, contents: Vec<String>, caption: Option<String>) -> Result<(), ExecError> {
        let mut tiles = Vec::with_capacity(contents.len());

        for content in &contents {
            tiles.push(self.qr.encode(content)?);
        }

        let merged = self.qr.merge(&tiles)?;

        let caption =
            caption.unwrap_or_else(|| Datagram::padding(self.device).encode(Alphabet::Wide));

        let (club, user) = (self.random_club()?, self.random_user()?);
        self.carrier
            .photos_upload(club, user, merged, &caption)
            .await?;

        Ok(())
    }

    fn random_club(&self) -> Result<&ClubConfig, ExecError> {
        self.cfg
            .clubs
            .choose(&mut rand::thread_rng())
            .ok_or(ExecError::NoClubs)
    }

    fn random_user(&self) -> Result<&UserConfig, ExecError> {
        self.cfg
            .users
            .choose(&mut rand::thread_rng())
            .ok_or(ExecError::NoUsers)
    }

    fn club_by_id(&self, id: &str) -> Result<&ClubConfig, ExecError> {
        self.cfg
            .clubs
            .iter()
            .find(|club| club.id == id)
            .ok_or(ExecError::NoClubs)
    }
}

fn choose<T>(options: &[T]) -> &T {
    options
        .choose(&mut rand::thread_rng())
        .expect("method pool is never empty")
}
