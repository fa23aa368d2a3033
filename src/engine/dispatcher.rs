use std::sync::Arc;

use tracing::{debug, warn};

use super::{post::Post, registry::Subscriber, DelayRange, Shutdown};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
    /// Subscribers not reached because of a shutdown.
    pub abandoned: usize,
}

/// Hand `post` to every subscriber, one after another, sleeping a random
/// `delay` between two callbacks. A failing subscriber is logged and the
/// next one still gets the post.
pub async fn dispatch(
    uid: &str,
    subscribers: &[(String, Arc<dyn Subscriber>)],
    post: &Post,
    delay: DelayRange,
    shutdown: &mut Shutdown,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();

    for (i, (key, subscriber)) in subscribers.iter().enumerate() {
        if i > 0 && !shutdown.sleep(delay.sample()).await {
            outcome.abandoned = subscribers.len() - i;
            break;
        }

        match shutdown.guard(subscriber.deliver(post)).await {
            Some(Ok(())) => {
                debug!(uid, key = %key, "post delivered");
                outcome.delivered += 1;
            }
            Some(Err(e)) => {
                warn!(uid, key = %key, "subscriber failed: {e}");
                outcome.failed += 1;
            }
            None => {
                outcome.abandoned = subscribers.len() - i;
                break;
            }
        }
    }

    outcome
}
