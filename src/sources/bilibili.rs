use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Deserialize};

use crate::error::UpstreamError;

use super::{FeedSource, RawCard};

const LIST_URL: &str = "https://api.vc.bilibili.com/dynamic_svr/v1/dynamic_svr/space_history";
const DETAIL_URL: &str =
    "https://api.vc.bilibili.com/dynamic_svr/v1/dynamic_svr/get_dynamic_detail";
const USER_URL: &str = "https://api.bilibili.com/x/space/acc/info";

// upstream rejects obvious bots
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/92.0.4515.159 Safari/537.36 Edg/92.0.902.78";

pub struct BiliClient {
    http: Client,
}

#[derive(Deserialize)]
struct BiliResponse<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}
#[derive(Deserialize)]
struct SpaceHistory {
    #[serde(default)]
    cards: Vec<RawCard>,
}
#[derive(Deserialize)]
struct DynamicDetail {
    card: RawCard,
}
#[derive(Deserialize)]
struct AccountInfo {
    name: String,
}

impl BiliClient {
    pub fn new() -> Result<Self, UpstreamError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self { http })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, UpstreamError> {
        let res = self
            .http
            .get(url)
            .header(header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await?
            .text()
            .await?;

        let raw: BiliResponse<T> = serde_json::from_str(&res)?;

        match raw {
            BiliResponse {
                code: 0,
                data: Some(data),
                ..
            } => Ok(data),
            BiliResponse { code, message, .. } => Err(UpstreamError::Api { code, message }),
        }
    }
}

#[async_trait]
impl FeedSource for BiliClient {
    async fn fetch_latest(&self, uid: &str) -> Result<RawCard, UpstreamError> {
        let history: SpaceHistory = self
            .get(LIST_URL, &[("host_uid", uid), ("offset_dynamic_id", "0")])
            .await?;

        // only the head of the list is ever inspected
        history
            .cards
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::EmptyFeed {
                uid: uid.to_owned(),
            })
    }

    async fn fetch_by_id(&self, post_id: &str) -> Result<RawCard, UpstreamError> {
        let detail: DynamicDetail = self.get(DETAIL_URL, &[("dynamic_id", post_id)]).await?;

        Ok(detail.card)
    }

    async fn resolve_name(&self, uid: &str) -> Result<String, UpstreamError> {
        let info: AccountInfo = self.get(USER_URL, &[("mid", uid), ("jsonp", "jsonp")]).await?;

        Ok(info.name)
    }
}
