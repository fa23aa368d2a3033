use serde_json::Value;

/// Decoded post of a tracked identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub author_name: String,
    pub permalink_url: String,
    /// The raw item with its embedded payload already parsed. Kept for
    /// consumers that need fields not modeled by [`PostKind`].
    pub raw: Value,
    pub kind: PostKind,
}

/// Content shape of a post.
#[derive(Debug, Clone, PartialEq)]
pub enum PostKind {
    Repost {
        comment_text: String,
        original: Box<Post>,
    },
    Image {
        description: String,
        images: Vec<String>,
    },
    Text {
        content: String,
    },
    Video {
        caption: String,
        title: String,
        cover_image_url: String,
        description: String,
        video_url: String,
    },
    Article {
        title: String,
        /// Empty when upstream only sent its "read more" placeholder.
        summary: String,
        images: Vec<String>,
        article_url: String,
    },
    Other {
        raw_type_code: u32,
    },
}

/// Upstream type codes. Every code is a distinct bit so that a set of kinds
/// fits into one mask.
pub mod type_code {
    pub const REPOST: u32 = 1;
    pub const IMAGE: u32 = 2;
    pub const TEXT: u32 = 4;
    pub const VIDEO: u32 = 8;
    pub const ARTICLE: u32 = 64;
    pub const OTHER: u32 = 256;
}

impl PostKind {
    /// Bit of this kind, see [`type_code`].
    pub fn flag(&self) -> u32 {
        match self {
            Self::Repost { .. } => type_code::REPOST,
            Self::Image { .. } => type_code::IMAGE,
            Self::Text { .. } => type_code::TEXT,
            Self::Video { .. } => type_code::VIDEO,
            Self::Article { .. } => type_code::ARTICLE,
            Self::Other { .. } => type_code::OTHER,
        }
    }
}

impl Post {
    /// Number of reposts wrapped around the innermost original.
    pub fn repost_depth(&self) -> usize {
        let mut depth = 0;
        let mut post = self;
        while let PostKind::Repost { original, .. } = &post.kind {
            depth += 1;
            post = original;
        }

        depth
    }
}
