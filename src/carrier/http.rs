//! reqwest-backed implementation of the [`Carrier`] trait against the
//! platform's REST API.
//!
//! Every call carries a context deadline equal to `api.timeout`; the
//! long-poll call overrides it to 30 s so a full 25 s wait fits. API errors
//! arrive as a JSON envelope `{error: {error_code, error_msg}}` next to the
//! `response` value.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{
    Carrier, CarrierError, Document, GroupsEdit, LongPollBatch, LongPollServer, LongPollSettings,
    Message, StorageEntry,
};
use crate::config::{ApiConfig, ClubConfig, UserConfig};

const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpCarrier {
    http: reqwest::Client,
    api: ApiConfig,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Option<ApiErrorBody>,
    response: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct MessageHistory {
    #[serde(default)]
    items: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct UploadServer {
    #[serde(default)]
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct DocUploaded {
    #[serde(default)]
    file: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct DocSaved {
    #[serde(default)]
    doc: Document,
}

#[derive(Debug, Deserialize)]
struct PhotoUploaded {
    #[serde(default)]
    server: i64,
    #[serde(default)]
    photos_list: String,
    #[serde(default)]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct PhotoSaved {
    #[serde(default)]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct PostCreated {
    #[serde(default)]
    post_id: i64,
}

#[derive(Debug, Deserialize)]
struct CommentCreated {
    #[serde(default)]
    comment_id: i64,
}

impl HttpCarrier {
    pub fn new(api: ApiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/method/{}", self.api.origin, method.trim_start_matches('/'))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        token: &str,
        params: &[(&str, String)],
    ) -> Result<T, CarrierError> {
        let mut form: Vec<(&str, String)> = vec![
            ("v", self.api.version.clone()),
            ("access_token", token.to_string()),
        ];
        form.extend(params.iter().cloned());

        let resp = self
            .http
            .post(self.method_url(method))
            .timeout(self.api.timeout())
            .form(&form)
            .send()
            .await
            .map_err(|e| CarrierError::Transport(e.to_string()))?;

        Self::parse_envelope(method, resp).await
    }

    async fn parse_envelope<T: DeserializeOwned>(
        method: &str,
        resp: reqwest::Response,
    ) -> Result<T, CarrierError> {
        if !resp.status().is_success() {
            return Err(CarrierError::Http(resp.status().as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| CarrierError::Transport(e.to_string()))?;

        let envelope: Envelope<T> = serde_json::from_slice(&body)
            .map_err(|e| CarrierError::Decode(format!("{method}: {e}")))?;

        if let Some(error) = envelope.error {
            if error.error_code != 0 {
                return Err(CarrierError::Api {
                    code: error.error_code,
                    message: error.error_msg,
                });
            }
        }

        envelope
            .response
            .ok_or_else(|| CarrierError::Decode(format!("{method}: empty response")))
    }

    async fn upload_multipart<T: DeserializeOwned>(
        &self,
        url: &str,
        field: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<T, CarrierError> {
        let part = Part::bytes(data).file_name(file_name.to_string());
        let form = Form::new().part(field.to_string(), part);

        let resp = self
            .http
            .post(url)
            .timeout(self.api.timeout())
            .multipart(form)
            .send()
            .await
            .map_err(|e| CarrierError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CarrierError::Http(resp.status().as_u16()));
        }

        resp.json::<T>()
            .await
            .map_err(|e| CarrierError::Decode(format!("upload: {e}")))
    }
}

#[async_trait]
impl Carrier for HttpCarrier {
    async fn send_message(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        text: &str,
    ) -> Result<i64, CarrierError> {
        self.call(
            "messages.send",
            &club.access_token,
            &[
                ("user_id", user.id.clone()),
                ("random_id", "0".to_string()),
                ("message", text.to_string()),
            ],
        )
        .await
    }

    async fn message_history(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        offset: i64,
        count: i64,
        rev: i64,
    ) -> Result<Vec<Message>, CarrierError> {
        let history: MessageHistory = self
            .call(
                "messages.getHistory",
                &club.access_token,
                &[
                    ("user_id", user.id.clone()),
                    ("offset", offset.to_string()),
                    ("count", count.to_string()),
                    ("rev", rev.to_string()),
                ],
            )
            .await?;

        Ok(history.items)
    }

    async fn long_poll_server(&self, club: &ClubConfig) -> Result<LongPollServer, CarrierError> {
        self.call(
            "groups.getLongPollServer",
            &club.access_token,
            &[("group_id", club.id.clone())],
        )
        .await
    }

    async fn long_poll(
        &self,
        _club: &ClubConfig,
        server: &LongPollServer,
        ts: &str,
        wait: u64,
    ) -> Result<LongPollBatch, CarrierError> {
        let resp = self
            .http
            .get(&server.server)
            .timeout(LONG_POLL_TIMEOUT)
            .query(&[
                ("act", "a_check"),
                ("key", server.key.as_str()),
                ("ts", ts),
                ("wait", &wait.to_string()),
            ])
            .send()
            .await
            .map_err(|e| CarrierError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CarrierError::Http(resp.status().as_u16()));
        }

        resp.json::<LongPollBatch>()
            .await
            .map_err(|e| CarrierError::Decode(format!("long poll: {e}")))
    }

    async fn long_poll_settings(
        &self,
        club: &ClubConfig,
    ) -> Result<LongPollSettings, CarrierError> {
        self.call(
            "groups.getLongPollSettings",
            &club.access_token,
            &[("group_id", club.id.clone())],
        )
        .await
    }

    async fn wall_post(&self, club: &ClubConfig, text: &str) -> Result<i64, CarrierError> {
        let created: PostCreated = self
            .call(
                "wall.post",
                &club.access_token,
                &[
                    ("owner_id", format!("-{}", club.id)),
                    ("message", text.to_string()),
                ],
            )
            .await?;

        Ok(created.post_id)
    }

    async fn wall_comment(
        &self,
        club: &ClubConfig,
        post_id: i64,
        text: &str,
    ) -> Result<i64, CarrierError> {
        let created: CommentCreated = self
            .call(
                "wall.createComment",
                &club.access_token,
                &[
                    ("owner_id", format!("-{}", club.id)),
                    ("post_id", post_id.to_string()),
                    ("message", text.to_string()),
                ],
            )
            .await?;

        Ok(created.comment_id)
    }

    async fn docs_upload(
        &self,
        club: &ClubConfig,
        data: Vec<u8>,
    ) -> Result<Document, CarrierError> {
        let server: UploadServer = self
            .call(
                "docs.getWallUploadServer",
                &club.access_token,
                &[("group_id", club.id.clone())],
            )
            .await?;

        let uploaded: DocUploaded = self
            .upload_multipart(&server.upload_url, "file", "file.txt", data)
            .await?;

        if !uploaded.error.is_empty() {
            return Err(CarrierError::Decode(uploaded.error));
        }

        let saved: DocSaved = self
            .call("docs.save", &club.access_token, &[("file", uploaded.file)])
            .await?;

        Ok(saved.doc)
    }

    async fn download_url(&self, url: &str) -> Result<Vec<u8>, CarrierError> {
        let resp = self
            .http
            .get(url)
            .timeout(self.api.timeout())
            .send()
            .await
            .map_err(|e| CarrierError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CarrierError::Http(resp.status().as_u16()));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| CarrierError::Transport(e.to_string()))?;

        Ok(body.to_vec())
    }

    async fn photos_upload(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        data: Vec<u8>,
        caption: &str,
    ) -> Result<i64, CarrierError> {
        let server: UploadServer = self
            .call(
                "photos.getUploadServer",
                &user.access_token,
                &[
                    ("album_id", club.album_id.clone()),
                    ("group_id", club.id.clone()),
                ],
            )
            .await?;

        let uploaded: PhotoUploaded = self
            .upload_multipart(&server.upload_url, "file1", "photo.png", data)
            .await?;

        let saved: Vec<PhotoSaved> = self
            .call(
                "photos.save",
                &user.access_token,
                &[
                    ("album_id", club.album_id.clone()),
                    ("group_id", club.id.clone()),
                    ("server", uploaded.server.to_string()),
                    ("photos_list", uploaded.photos_list),
                    ("hash", uploaded.hash),
                    ("caption", caption.to_string()),
                ],
            )
            .await?;

        saved
            .first()
            .map(|photo| photo.id)
            .ok_or_else(|| CarrierError::Decode("photos.save: empty response".to_string()))
    }

    async fn storage_get(
        &self,
        club: &ClubConfig,
        keys: &[String],
    ) -> Result<Vec<StorageEntry>, CarrierError> {
        self.call(
            "storage.get",
            &club.access_token,
            &[
                ("keys", keys.join(",")),
                ("user_id", club.id.clone()),
            ],
        )
        .await
    }

    async fn storage_set(
        &self,
        club: &ClubConfig,
        key: &str,
        value: &str,
    ) -> Result<(), CarrierError> {
        let _: i64 = self
            .call(
                "storage.set",
                &club.access_token,
                &[
                    ("key", key.to_string()),
                    ("value", value.to_string()),
                    ("user_id", club.id.clone()),
                ],
            )
            .await?;

        Ok(())
    }

    async fn groups_edit(&self, club: &ClubConfig, edit: GroupsEdit) -> Result<(), CarrierError> {
        let mut params = vec![("group_id", club.id.clone())];

        if let Some(description) = edit.description {
            params.push(("description", description));
        }

        if let Some(website) = edit.website {
            params.push(("website", website));
        }

        let _: i64 = self.call("groups.edit", &club.access_token, &params).await?;

        Ok(())
    }

    async fn video_comment(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        text: &str,
    ) -> Result<(), CarrierError> {
        let _: i64 = self
            .call(
                "video.createComment",
                &user.access_token,
                &[
                    ("owner_id", format!("-{}", club.id)),
                    ("video_id", club.video_id.clone()),
                    ("message", text.to_string()),
                ],
            )
            .await?;

        Ok(())
    }

    async fn photo_comment(
        &self,
        club: &ClubConfig,
        user: &UserConfig,
        text: &str,
    ) -> Result<(), CarrierError> {
        let _: i64 = self
            .call(
                "photos.createComment",
                &user.access_token,
                &[
                    ("owner_id", format!("-{}", club.id)),
                    ("photo_id", club.photo_id.clone()),
                    ("message", text.to_string()),
                ],
            )
            .await?;

        Ok(())
    }

    async fn check_club(&self, club: &ClubConfig) -> Result<(), CarrierError> {
        let _: serde_json::Value = self
            .call(
                "groups.getById",
                &club.access_token,
                &[("group_id", club.id.clone())],
            )
            .await?;

        Ok(())
    }

    async fn check_user(&self, user: &UserConfig) -> Result<(), CarrierError> {
        let _: serde_json::Value = self.call("users.get", &user.access_token, &[]).await?;

        Ok(())
    }
}
