//! Turns raw feed items into [`Post`] values.
//!
//! Reposts are resolved through [`FeedSource::fetch_by_id`]. The chain is
//! walked iteratively: every repost wrapper is parked on a stack until the
//! non-repost original is decoded, then the stack is folded back up.

use std::collections::HashSet;

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use crate::{
    error::EngineError,
    sources::{CardDesc, FeedSource, RawCard},
};

use super::post::{type_code, Post, PostKind};

/// Summaries upstream sends instead of the real one for long articles.
const TRUNCATED_SUMMARIES: &[&str] = &["点击进入查看全文>"];

/// Raw item with its payload parsed in place and the common fields
/// extracted.
struct Envelope {
    desc: CardDesc,
    author_name: String,
    permalink_url: String,
    /// Whole item, `card` replaced by the parsed payload.
    raw: Value,
}

#[derive(Deserialize)]
struct ItemCard<T> {
    item: T,
}
#[derive(Deserialize)]
struct ContentItem {
    #[serde(default)]
    content: String,
}
#[derive(Deserialize)]
struct ImageItem {
    #[serde(default)]
    description: String,
    #[serde(default)]
    pictures: Vec<Picture>,
}
#[derive(Deserialize)]
struct Picture {
    img_src: String,
}
#[derive(Deserialize)]
struct VideoCard {
    #[serde(default)]
    dynamic: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    pic: String,
    #[serde(default)]
    desc: String,
}
#[derive(Deserialize)]
struct ArticleCard {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    image_urls: Vec<String>,
}

/// Decode one raw item. Reposts fetch their originals via `source`.
pub async fn decode(card: RawCard, source: &dyn FeedSource) -> Result<Post, EngineError> {
    let mut pending: Vec<(Envelope, String)> = Vec::new();
    let mut seen = HashSet::new();
    let mut card = card;

    let leaf = loop {
        let envelope = Envelope::open(card)?;
        if envelope.desc.r#type != type_code::REPOST {
            break envelope.decode_leaf()?;
        }

        let id = envelope.desc.dynamic_id_str.clone();
        if !seen.insert(id.clone()) {
            return Err(EngineError::malformed(id, "repost chain loops back on itself"));
        }

        let origin_id = match envelope.desc.orig_dy_id_str.as_deref() {
            Some(origin) if !origin.is_empty() => origin.to_owned(),
            _ => return Err(EngineError::malformed(id, "repost without original post id")),
        };
        let comment: ItemCard<ContentItem> = envelope.payload()?;

        pending.push((envelope, unescape(&comment.item.content)));
        card = source.fetch_by_id(&origin_id).await?;
    };

    let post = pending
        .into_iter()
        .rev()
        .fold(leaf, |original, (envelope, comment_text)| {
            envelope.into_post(PostKind::Repost {
                comment_text,
                original: Box::new(original),
            })
        });

    Ok(post)
}

/// Fetch a post by its ID and decode it.
pub async fn fetch_and_decode(post_id: &str, source: &dyn FeedSource) -> Result<Post, EngineError> {
    let card = source.fetch_by_id(post_id).await?;

    decode(card, source).await
}

impl Envelope {
    fn open(card: RawCard) -> Result<Self, EngineError> {
        let id = card.desc.dynamic_id_str.clone();
        let details: Value =
            serde_json::from_str(&card.card).map_err(|e| EngineError::malformed(&id, e))?;

        let RawCard { desc, extra, .. } = card;
        let mut raw = Value::Object(extra);
        raw["desc"] = serde_json::to_value(&desc).map_err(|e| EngineError::malformed(&id, e))?;
        raw["card"] = details;

        Ok(Self {
            author_name: desc.user_profile.info.uname.clone(),
            permalink_url: format!("https://t.bilibili.com/{id}"),
            desc,
            raw,
        })
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        T::deserialize(&self.raw["card"])
            .map_err(|e| EngineError::malformed(&self.desc.dynamic_id_str, e))
    }

    fn decode_leaf(self) -> Result<Post, EngineError> {
        let kind = match self.desc.r#type {
            type_code::IMAGE => {
                let ItemCard { item }: ItemCard<ImageItem> = self.payload()?;
                PostKind::Image {
                    description: unescape(&item.description),
                    images: item.pictures.iter().map(|p| unescape(&p.img_src)).collect(),
                }
            }
            type_code::TEXT => {
                let ItemCard { item }: ItemCard<ContentItem> = self.payload()?;
                PostKind::Text {
                    content: unescape(&item.content),
                }
            }
            type_code::VIDEO => {
                let card: VideoCard = self.payload()?;
                let bvid = self.desc.bvid.as_deref().ok_or_else(|| {
                    EngineError::malformed(&self.desc.dynamic_id_str, "video without bvid")
                })?;
                PostKind::Video {
                    caption: unescape(&card.dynamic),
                    title: unescape(&card.title),
                    cover_image_url: unescape(&card.pic),
                    description: unescape(&card.desc),
                    video_url: format!("https://b23.tv/{bvid}"),
                }
            }
            type_code::ARTICLE => {
                let card: ArticleCard = self.payload()?;
                let summary = unescape(&card.summary);
                PostKind::Article {
                    title: unescape(&card.title),
                    summary: if TRUNCATED_SUMMARIES.contains(&summary.as_str()) {
                        String::new()
                    } else {
                        summary
                    },
                    images: card.image_urls.iter().map(|u| unescape(u)).collect(),
                    article_url: format!("https://www.bilibili.com/read/cv{}", card.id),
                }
            }
            raw_type_code => PostKind::Other { raw_type_code },
        };

        Ok(self.into_post(kind))
    }

    fn into_post(self, kind: PostKind) -> Post {
        Post {
            author_name: self.author_name,
            permalink_url: self.permalink_url,
            raw: self.raw,
            kind,
        }
    }
}

/// Legacy percent-unescaping: `%XX` and `%uXXXX` become the UTF-16 code unit
/// they name, anything else is kept as is.
pub fn unescape(s: &str) -> String {
    if !s.contains('%') {
        return s.to_owned();
    }

    let mut units: Vec<u16> = Vec::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('%') {
        units.extend(rest[..pos].encode_utf16());
        let tail = &rest[pos + 1..];

        if let Some(unit) = tail.strip_prefix('u').and_then(|h| hex_unit(h, 4)) {
            units.push(unit);
            rest = &tail[5..];
        } else if let Some(unit) = hex_unit(tail, 2) {
            units.push(unit);
            rest = &tail[2..];
        } else {
            units.push(u16::from(b'%'));
            rest = tail;
        }
    }
    units.extend(rest.encode_utf16());

    String::from_utf16_lossy(&units)
}

fn hex_unit(s: &str, len: usize) -> Option<u16> {
    let digits = s.get(..len)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    u16::from_str_radix(digits, 16).ok()
}
