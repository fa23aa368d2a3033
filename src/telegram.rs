use std::{
    fmt::{self, Display, Write},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time;
use tracing::{debug, warn};

use crate::{
    config::Snowflake,
    engine::{Post, PostKind, Subscriber},
    error::SubscriberError,
};

const API_URL: &str = "https://api.telegram.org";
/// Telegram refuses longer captions.
const CAPTION_LIMIT: usize = 1024;
/// Telegram accepts 2..=10 items per media group.
const MEDIA_GROUP_LIMIT: usize = 10;
/// Images of an image post that make it into the message.
const IMAGES_SHOWN: usize = 2;

pub struct TelegramClient {
    token: String,
    api_url: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    Scheme(#[from] serde_json::Error),
    #[error("API returned error {error_code}: {description}")]
    Server {
        error_code: u32,
        description: String,
    },
    #[error("ratelimited for {} seconds", .timeout.as_secs())]
    RateLimited { timeout: Duration },
}

pub struct SendMessage<'a> {
    client: &'a TelegramClient,
    chat_id: &'a Snowflake,
    text: String,
    photos: Vec<String>,
}
#[derive(Serialize)]
pub struct TelegramMedia<'a> {
    pub r#type: &'static str,
    pub media: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<&'static str>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TelegramResponse<T> {
    Ok {
        result: T,
    },
    Err {
        error_code: u32,
        description: String,
        #[serde(default)]
        parameters: Option<TelegramRateLimitError>,
    },
}
#[derive(Deserialize)]
struct TelegramRateLimitError {
    retry_after: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Sent {
    One(TelegramMessage),
    Group(Vec<TelegramMessage>),
}
#[derive(Deserialize)]
#[non_exhaustive]
struct TelegramMessage {
    message_id: u64,
}

/// Posts of one followed identity into one chat.
pub struct TelegramSubscriber {
    pub client: Arc<TelegramClient>,
    pub chat_id: Snowflake,
    /// Kind flags of posts that are not forwarded.
    pub muted: u32,
    pub followers: Vec<String>,
}

pub struct ProtectedString<'a>(pub &'a str);

impl<'a> Display for ProtectedString<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '&' => f.write_str("&amp;")?,
                '>' => f.write_str("&gt;")?,
                '<' => f.write_str("&lt;")?,
                '"' => f.write_str("&quot;")?,
                _ => f.write_char(c)?,
            }
        }

        Ok(())
    }
}

impl TelegramClient {
    pub fn new(token: String) -> Self {
        Self {
            token,
            api_url: API_URL.to_owned(),
            http: Client::new(),
        }
    }

    /// Talk to a Bot API server other than the public one.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn send_message<'a>(&'a self, chat_id: &'a Snowflake) -> SendMessage<'a> {
        SendMessage {
            client: self,
            chat_id,
            text: String::new(),
            photos: Vec::new(),
        }
    }
}

impl<'a> SendMessage<'a> {
    pub fn by_post(mut self, post: &Post, followers: &[String]) -> Result<Self, fmt::Error> {
        mentions(followers, &mut self.text)?;
        render(post, &mut self.text, &mut self.photos)?;

        if !self.photos.is_empty() && self.text.chars().count() > CAPTION_LIMIT {
            warn!(
                chat = %self.chat_id,
                url = %post.permalink_url,
                dropped = self.photos.len(),
                "text too long for a caption, sending without photos"
            );
            self.photos.clear();
        }
        self.photos.truncate(MEDIA_GROUP_LIMIT);

        Ok(self)
    }

    /// Bot API method the message goes through.
    fn method(&self) -> &'static str {
        if self.photos.is_empty() {
            "sendMessage"
        } else if self.photos.len() == 1 {
            "sendPhoto"
        } else {
            "sendMediaGroup"
        }
    }

    pub async fn send(&self) -> Result<u64, TelegramError> {
        let method = self.method();
        let mut params = vec![("chat_id", self.chat_id.to_string())];
        match method {
            "sendPhoto" => {
                params.push(("photo", self.photos[0].clone()));
                params.push(("caption", self.text.clone()));
                params.push(("parse_mode", "HTML".to_owned()));
            }
            "sendMediaGroup" => {
                let media: Vec<TelegramMedia> = self
                    .photos
                    .iter()
                    .enumerate()
                    .map(|(i, photo)| TelegramMedia {
                        r#type: "photo",
                        media: photo,
                        caption: (i == 0).then_some(self.text.as_str()),
                        parse_mode: (i == 0).then_some("HTML"),
                    })
                    .collect();
                params.push(("media", serde_json::to_string(&media)?));
            }
            _ => {
                params.push(("text", self.text.clone()));
                params.push(("parse_mode", "HTML".to_owned()));
            }
        }

        let res = self
            .client
            .http
            .post(format!(
                "{}/bot{}/{method}",
                self.client.api_url, self.client.token
            ))
            .form(&params)
            .send()
            .await?
            .text()
            .await?;

        let res: TelegramResponse<Sent> = serde_json::from_str(&res)?;

        match res {
            TelegramResponse::Ok {
                result: Sent::One(message),
            } => Ok(message.message_id),
            TelegramResponse::Ok {
                result: Sent::Group(messages),
            } => Ok(messages.first().map(|m| m.message_id).unwrap_or_default()),

            TelegramResponse::Err {
                error_code: 429,
                parameters: Some(TelegramRateLimitError { retry_after }),
                ..
            } => Err(TelegramError::RateLimited {
                timeout: Duration::from_secs(retry_after),
            }),

            TelegramResponse::Err {
                error_code,
                description,
                ..
            } => Err(TelegramError::Server {
                error_code,
                description,
            }),
        }
    }
}

#[async_trait]
impl Subscriber for TelegramSubscriber {
    async fn deliver(&self, post: &Post) -> Result<(), SubscriberError> {
        if post.kind.flag() & self.muted != 0 {
            debug!(chat = %self.chat_id, url = %post.permalink_url, "post kind muted");
            return Ok(());
        }

        let message = self
            .client
            .send_message(&self.chat_id)
            .by_post(post, &self.followers)?;
        let res = match message.send().await {
            Err(TelegramError::RateLimited { timeout }) => {
                warn!(chat = %self.chat_id, "telegram rate limit, retrying in {timeout:?}");
                time::sleep(timeout).await;
                message.send().await
            }
            res => res,
        };

        let message_id = res?;
        debug!(chat = %self.chat_id, message_id, "post sent to telegram");
        Ok(())
    }
}

fn mentions(followers: &[String], text: &mut String) -> fmt::Result {
    for (i, follower) in followers.iter().enumerate() {
        if i > 0 {
            text.push(' ');
        }
        match follower.parse::<u64>() {
            Ok(id) => write!(text, "<a href=\"tg://user?id={id}\">{id}</a>")?,
            Err(_) => write!(text, "{}", ProtectedString(follower))?,
        }
    }
    if !followers.is_empty() {
        text.push('\n');
    }

    Ok(())
}

/// Append the HTML text of `post` to `text`, and its pictures to `photos`.
fn render(post: &Post, text: &mut String, photos: &mut Vec<String>) -> fmt::Result {
    let author = ProtectedString(&post.author_name);
    let link = ProtectedString(&post.permalink_url);

    match &post.kind {
        PostKind::Repost {
            comment_text,
            original,
        } => {
            write!(
                text,
                "{author} reposted:\n{}\nlink: {link}\n=== original ===\n",
                ProtectedString(comment_text)
            )?;
            render(original, text, photos)
        }
        PostKind::Image {
            description,
            images,
        } => {
            photos.extend(images.iter().take(IMAGES_SHOWN).cloned());
            write!(text, "{author} posted:\n{}", ProtectedString(description))?;
            if images.len() > IMAGES_SHOWN {
                write!(text, "\n({} images in total)", images.len())?;
            }
            write!(text, "\nlink: {link}")
        }
        PostKind::Text { content } => write!(
            text,
            "{author} posted:\n{}\nlink: {link}",
            ProtectedString(content)
        ),
        PostKind::Video {
            caption,
            title,
            cover_image_url,
            description,
            video_url,
        } => {
            photos.push(cover_image_url.clone());
            write!(
                text,
                "{author} uploaded a video:\n{}\n<b>{}</b>\n{}\nlink: {}",
                ProtectedString(caption),
                ProtectedString(title),
                ProtectedString(description),
                ProtectedString(video_url)
            )
        }
        PostKind::Article {
            title,
            summary,
            images,
            article_url,
        } => {
            photos.extend(images.iter().cloned());
            write!(
                text,
                "{author} published an article:\n<b>{}</b>\n{}\nlink: {}",
                ProtectedString(title),
                ProtectedString(summary),
                ProtectedString(article_url)
            )
        }
        PostKind::Other { raw_type_code } => write!(
            text,
            "{author} posted: unsupported post type {raw_type_code}\nlink: {link}"
        ),
    }
}
