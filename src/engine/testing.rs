//! Fakes shared by the engine tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time;

use crate::{
    error::{SubscriberError, UpstreamError},
    sources::{CardDesc, FeedSource, RawCard, UserInfo, UserProfile},
};

use super::{IdentityState, Post, PostKind, StateNotifier, Subscriber};

/// Raw item authored by "alice".
pub fn card(id: &str, r#type: u32, timestamp: u64, payload: Value) -> RawCard {
    RawCard {
        desc: CardDesc {
            r#type,
            dynamic_id_str: id.to_owned(),
            timestamp,
            user_profile: UserProfile {
                info: UserInfo {
                    uname: "alice".to_owned(),
                    extra: Map::new(),
                },
                extra: Map::new(),
            },
            bvid: None,
            orig_dy_id_str: None,
            extra: Map::new(),
        },
        card: payload.to_string(),
        extra: Map::new(),
    }
}

pub fn text_post(content: &str) -> Post {
    Post {
        author_name: "alice".to_owned(),
        permalink_url: "https://t.bilibili.com/1".to_owned(),
        raw: Value::Object(Default::default()),
        kind: PostKind::Text {
            content: content.to_owned(),
        },
    }
}

/// Feed source answering from queued responses.
#[derive(Default)]
pub struct ScriptedSource {
    latest: Mutex<HashMap<String, VecDeque<Result<RawCard, UpstreamError>>>>,
    details: Mutex<HashMap<String, RawCard>>,
    names: Mutex<HashMap<String, String>>,
    latest_requests: AtomicUsize,
    detail_requests: AtomicUsize,
    name_requests: AtomicUsize,
    latest_delay: Mutex<Duration>,
    detail_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn push_latest(&self, uid: &str, card: RawCard) {
        self.queue(uid, Ok(card));
    }

    pub fn push_latest_error(&self, uid: &str, code: i64) {
        self.queue(
            uid,
            Err(UpstreamError::Api {
                code,
                message: "scripted failure".to_owned(),
            }),
        );
    }

    fn queue(&self, uid: &str, res: Result<RawCard, UpstreamError>) {
        self.latest
            .lock()
            .unwrap()
            .entry(uid.to_owned())
            .or_default()
            .push_back(res);
    }

    pub fn add_detail(&self, card: RawCard) {
        self.details
            .lock()
            .unwrap()
            .insert(card.desc.dynamic_id_str.clone(), card);
    }

    pub fn set_name(&self, uid: &str, name: &str) {
        self.names
            .lock()
            .unwrap()
            .insert(uid.to_owned(), name.to_owned());
    }

    /// Every `fetch_latest` takes this long before answering.
    pub fn delay_latest(&self, delay: Duration) {
        *self.latest_delay.lock().unwrap() = delay;
    }

    /// Every `fetch_by_id` takes this long before answering.
    pub fn delay_details(&self, delay: Duration) {
        *self.detail_delay.lock().unwrap() = delay;
    }

    /// Most `fetch_latest` calls ever running at the same time.
    pub fn max_concurrent_latest(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn latest_requests(&self) -> usize {
        self.latest_requests.load(Ordering::SeqCst)
    }

    pub fn detail_requests(&self) -> usize {
        self.detail_requests.load(Ordering::SeqCst)
    }

    pub fn name_requests(&self) -> usize {
        self.name_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    async fn fetch_latest(&self, uid: &str) -> Result<RawCard, UpstreamError> {
        self.latest_requests.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.latest_delay.lock().unwrap();
        time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.latest
            .lock()
            .unwrap()
            .get_mut(uid)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(UpstreamError::EmptyFeed {
                    uid: uid.to_owned(),
                })
            })
    }

    async fn fetch_by_id(&self, post_id: &str) -> Result<RawCard, UpstreamError> {
        self.detail_requests.fetch_add(1, Ordering::SeqCst);
        let delay = *self.detail_delay.lock().unwrap();
        time::sleep(delay).await;

        self.details
            .lock()
            .unwrap()
            .get(post_id)
            .cloned()
            .ok_or_else(|| UpstreamError::Api {
                code: 500207,
                message: format!("no post {post_id}"),
            })
    }

    async fn resolve_name(&self, uid: &str) -> Result<String, UpstreamError> {
        self.name_requests.fetch_add(1, Ordering::SeqCst);
        self.names
            .lock()
            .unwrap()
            .get(uid)
            .cloned()
            .ok_or_else(|| UpstreamError::Api {
                code: -404,
                message: "no such user".to_owned(),
            })
    }
}

#[derive(Default)]
pub struct RecordingSubscriber {
    received: Mutex<Vec<Post>>,
    fail: bool,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records the post, then reports failure.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn received(&self) -> Vec<Post> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    async fn deliver(&self, post: &Post) -> Result<(), SubscriberError> {
        self.received.lock().unwrap().push(post.clone());
        if self.fail {
            return Err("subscriber is broken".into());
        }

        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    updates: Mutex<Vec<IdentityState>>,
}

impl RecordingNotifier {
    pub fn updates(&self) -> Vec<IdentityState> {
        self.updates.lock().unwrap().clone()
    }
}

impl StateNotifier for RecordingNotifier {
    fn notify(&self, state: &IdentityState) {
        self.updates.lock().unwrap().push(state.clone());
    }
}
