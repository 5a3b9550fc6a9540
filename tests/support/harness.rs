//! Shared test harness: an in-memory social platform and a pair of tunnel
//! engines wired through it.
//!
//! The platform broadcasts every carrier write to every subscriber as the
//! matching long-poll event (the real platform echoes a club's activity to
//! all listeners, including its author, so the loopback filter has to deal
//! with that here too), keeps a shared key-value storage that both storage
//! watchers poll, and serves uploaded documents by URL.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use sideband::carrier::{
    Carrier, CarrierError, Document, GroupsEdit, LongPollBatch, LongPollServer, LongPollSettings,
    Message, StorageEntry, Update, UpdateChanges, UpdateObject, UpdateValueChange,
};
use sideband::config::{ClubConfig, Config, UserConfig};
use sideband::runtime::{Engine, EngineHandle};

const POLL_SLICE: Duration = Duration::from_millis(50);

pub struct MemoryPlatform {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Update>>>,
    storage: Mutex<HashMap<String, String>>,
    docs: Mutex<HashMap<i64, Vec<u8>>>,
    next_id: AtomicI64,
}

impl MemoryPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            storage: Mutex::new(HashMap::new()),
            docs: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
        })
    }

    /// A carrier handle with its own long-poll subscription.
    pub fn carrier(self: &Arc<Self>) -> Arc<MemoryCarrier> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);

        Arc::new(MemoryCarrier {
            platform: self.clone(),
            updates: tokio::sync::Mutex::new(rx),
        })
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn broadcast(&self, kind: &str, object: UpdateObject) {
        let update = Update {
            kind: kind.to_string(),
            object,
        };

        for subscriber in self.subscribers.lock().unwrap().iter() {
            let _ = subscriber.send(update.clone());
        }
    }

    fn text_update(&self, kind: &str, text: &str) {
        self.broadcast(
            kind,
            UpdateObject {
                text: text.to_string(),
                ..UpdateObject::default()
            },
        );
    }

    /// Push an arbitrary text event at every subscriber, as if a third
    /// party had posted it.
    pub fn inject(&self, kind: &str, text: &str) {
        self.text_update(kind, text);
    }
}

pub struct MemoryCarrier {
    platform: Arc<MemoryPlatform>,
    updates: tokio::sync::Mutex<mpsc::UnboundedReceiver<Update>>,
}

#[async_trait]
impl Carrier for MemoryCarrier {
    async fn send_message(
        &self,
        _club: &ClubConfig,
        _user: &UserConfig,
        text: &str,
    ) -> Result<i64, CarrierError> {
        self.platform.text_update("message_reply", text);
        Ok(self.platform.next_id())
    }

    async fn message_history(
        &self,
        _club: &ClubConfig,
        _user: &UserConfig,
        _offset: i64,
        _count: i64,
        _rev: i64,
    ) -> Result<Vec<Message>, CarrierError> {
        Ok(Vec::new())
    }

    async fn long_poll_server(&self, _club: &ClubConfig) -> Result<LongPollServer, CarrierError> {
        Ok(LongPollServer {
            server: "mem://long-poll".to_string(),
            key: String::new(),
            ts: "0".to_string(),
        })
    }

    async fn long_poll(
        &self,
        _club: &ClubConfig,
        _server: &LongPollServer,
        _ts: &str,
        _wait: u64,
    ) -> Result<LongPollBatch, CarrierError> {
        let mut rx = self.updates.lock().await;
        let mut updates = Vec::new();

        if let Ok(Some(first)) = tokio::time::timeout(POLL_SLICE, rx.recv()).await {
            updates.push(first);

            while let Ok(more) = rx.try_recv() {
                updates.push(more);
            }
        }

        Ok(LongPollBatch {
            ts: "0".to_string(),
            failed: 0,
            updates,
        })
    }

    async fn long_poll_settings(
        &self,
        _club: &ClubConfig,
    ) -> Result<LongPollSettings, CarrierError> {
        let events = [
            "message_reply",
            "wall_post_new",
            "wall_reply_new",
            "photo_new",
            "group_change_settings",
        ]
        .into_iter()
        .map(|name| (name.to_string(), true))
        .collect();

        Ok(LongPollSettings {
            is_enabled: true,
            events,
        })
    }

    async fn wall_post(&self, _club: &ClubConfig, text: &str) -> Result<i64, CarrierError> {
        self.platform.text_update("wall_post_new", text);
        Ok(self.platform.next_id())
    }

    async fn wall_comment(
        &self,
        _club: &ClubConfig,
        _post_id: i64,
        text: &str,
    ) -> Result<i64, CarrierError> {
        self.platform.text_update("wall_reply_new", text);
        Ok(self.platform.next_id())
    }

    async fn docs_upload(
        &self,
        _club: &ClubConfig,
        data: Vec<u8>,
    ) -> Result<Document, CarrierError> {
        let id = self.platform.next_id();
        self.platform.docs.lock().unwrap().insert(id, data);

        Ok(Document {
            id,
            url: format!("https://mem.example/doc{id}"),
        })
    }

    async fn download_url(&self, url: &str) -> Result<Vec<u8>, CarrierError> {
        let id: i64 = url
            .rsplit("doc")
            .next()
            .and_then(|tail| tail.split('?').next())
            .and_then(|tail| tail.parse().ok())
            .ok_or_else(|| CarrierError::Transport(format!("unknown url {url}")))?;

        self.platform
            .docs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(CarrierError::Http(404))
    }

    async fn photos_upload(
        &self,
        _club: &ClubConfig,
        _user: &UserConfig,
        _data: Vec<u8>,
        _caption: &str,
    ) -> Result<i64, CarrierError> {
        Err(CarrierError::Api {
            code: 5,
            message: "user authorization failed".to_string(),
        })
    }

    async fn storage_get(
        &self,
        _club: &ClubConfig,
        keys: &[String],
    ) -> Result<Vec<StorageEntry>, CarrierError> {
        let storage = self.platform.storage.lock().unwrap();

        Ok(keys
            .iter()
            .map(|key| StorageEntry {
                key: key.clone(),
                value: storage.get(key).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn storage_set(
        &self,
        _club: &ClubConfig,
        key: &str,
        value: &str,
    ) -> Result<(), CarrierError> {
        self.platform
            .storage
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());

        Ok(())
    }

    async fn groups_edit(&self, _club: &ClubConfig, edit: GroupsEdit) -> Result<(), CarrierError> {
        if let Some(website) = edit.website {
            self.platform.broadcast(
                "group_change_settings",
                UpdateObject {
                    changes: UpdateChanges {
                        website: UpdateValueChange {
                            old_value: String::new(),
                            new_value: website,
                        },
                    },
                    ..UpdateObject::default()
                },
            );
        }

        Ok(())
    }

    async fn video_comment(
        &self,
        _club: &ClubConfig,
        _user: &UserConfig,
        _text: &str,
    ) -> Result<(), CarrierError> {
        Err(CarrierError::Api {
            code: 5,
            message: "user authorization failed".to_string(),
        })
    }

    async fn photo_comment(
        &self,
        _club: &ClubConfig,
        _user: &UserConfig,
        _text: &str,
    ) -> Result<(), CarrierError> {
        Err(CarrierError::Api {
            code: 5,
            message: "user authorization failed".to_string(),
        })
    }

    async fn check_club(&self, _club: &ClubConfig) -> Result<(), CarrierError> {
        Ok(())
    }

    async fn check_user(&self, _user: &UserConfig) -> Result<(), CarrierError> {
        Ok(())
    }
}

/// Configuration both engines share: ephemeral listener port, no
/// user-authorised methods (they would need external QR binaries), small
/// forward chunks so everything stays on "small" carriers.
pub fn test_config(secret: &str) -> Config {
    let mut cfg = Config::default();

    cfg.socks.listen_host = "127.0.0.1".to_string();
    cfg.socks.listen_port = 0;
    cfg.socks.forward_size = 1000;
    cfg.socks.forward_interval_ms = 100;
    cfg.api.unathorized = true;
    cfg.session.secret = secret.to_string();

    cfg.clubs.push(ClubConfig {
        name: "club".to_string(),
        id: "100".to_string(),
        access_token: "club-token".to_string(),
        album_id: "1".to_string(),
        photo_id: "2".to_string(),
        video_id: "3".to_string(),
    });

    cfg.users.push(UserConfig {
        name: "user".to_string(),
        id: "200".to_string(),
        access_token: "user-token".to_string(),
    });

    cfg
}

/// Two engines tunnelling through one in-memory platform. The client's
/// SOCKS listener is the test entry point; the server engine dials the
/// tunnelled targets.
pub struct TunnelHarness {
    pub platform: Arc<MemoryPlatform>,
    pub client: EngineHandle,
    pub server: EngineHandle,
}

impl TunnelHarness {
    pub async fn spawn() -> Self {
        let platform = MemoryPlatform::new();
        let secret = sideband::crypto::generate_secret();
        let cfg = test_config(&secret);

        let client = Engine::with_device(cfg.clone(), platform.carrier(), 1_000)
            .expect("client engine")
            .start()
            .await
            .expect("client start");

        let server = Engine::with_device(cfg, platform.carrier(), 2_000)
            .expect("server engine")
            .start()
            .await
            .expect("server start");

        Self {
            platform,
            client,
            server,
        }
    }

    pub fn socks_addr(&self) -> SocketAddr {
        self.client.socks_addr
    }

    pub async fn shutdown(self) {
        self.client.shutdown();
        self.server.shutdown();
        let _ = self.client.wait().await;
        let _ = self.server.wait().await;
    }
}

/// TCP server echoing every byte back, for use as a tunnel target.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };

            tokio::spawn(async move {
                let mut buf = [0u8; 4096];

                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}
