pub mod bilibili;
mod source;

pub use source::{CardDesc, FeedSource, RawCard, UserInfo, UserProfile};
