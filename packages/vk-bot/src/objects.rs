//! VK API objects carried by events.
//!
//! Decoding is lenient: missing fields take their defaults and unknown
//! attachment types are kept as raw JSON.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Private or community message. Replies and forwards nest recursively.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Message {
    pub id: i64,
    pub date: i64,
    pub peer_id: i64,
    pub from_id: i64,
    pub text: String,
    pub random_id: i64,
    pub conversation_message_id: i64,
    #[serde(deserialize_with = "flag")]
    pub important: bool,
    pub payload: String,
    #[serde(deserialize_with = "flag")]
    pub out: bool,
    #[serde(deserialize_with = "flag")]
    pub is_hidden: bool,
    pub attachments: Vec<Attachment>,
    pub action: Option<Action>,
    pub reply_message: Option<Box<Message>>,
    pub fwd_messages: Vec<Message>,
}

impl Message {
    /// Decode a message, accepting both the bare object and the
    /// `{message, client_info}` wrapper newer API versions send.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        match value.get("message") {
            Some(inner @ Value::Object(_)) => Self::deserialize(inner),
            _ => Self::deserialize(value),
        }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.date, 0)
    }

    /// Conversation peers above this id are group chats.
    pub fn is_chat(&self) -> bool {
        self.peer_id > 2_000_000_000
    }

    /// Depth-first walk over the reply and forwarded messages.
    pub fn nested(&self) -> Vec<&Message> {
        let mut nested = Vec::new();
        if let Some(reply) = &self.reply_message {
            nested.push(reply.as_ref());
            nested.extend(reply.nested());
        }
        for forwarded in &self.fwd_messages {
            nested.push(forwarded);
            nested.extend(forwarded.nested());
        }
        nested
    }
}

/// Service action in a chat (invite, kick, title change...).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    pub member_id: i64,
    pub text: String,
    /// Invited person's email, for negative member ids
    pub email: String,
    /// New chat cover in three sizes
    pub photo: HashMap<String, String>,
}

/// Identity shared by media attachments.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaId {
    pub id: i64,
    pub owner_id: i64,
    pub access_key: String,
}

impl MediaId {
    /// `<type><owner_id>_<id>[_<access_key>]`, the form `attachment=` expects.
    pub fn prepared(&self, kind: &str) -> String {
        if self.access_key.is_empty() {
            format!("{}{}_{}", kind, self.owner_id, self.id)
        } else {
            format!("{}{}_{}_{}", kind, self.owner_id, self.id, self.access_key)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    Photo(Photo),
    Video(Video),
    Audio(Audio),
    Doc(Doc),
    Link(Link),
    Sticker(Sticker),
    Gift(Gift),
    Wall(Box<Wall>),
    Other { kind: String, content: Value },
}

impl Attachment {
    pub fn kind(&self) -> &str {
        match self {
            Attachment::Photo(_) => "photo",
            Attachment::Video(_) => "video",
            Attachment::Audio(_) => "audio",
            Attachment::Doc(_) => "doc",
            Attachment::Link(_) => "link",
            Attachment::Sticker(_) => "sticker",
            Attachment::Gift(_) => "gift",
            Attachment::Wall(_) => "wall",
            Attachment::Other { kind, .. } => kind,
        }
    }

    pub fn media(&self) -> Option<&MediaId> {
        match self {
            Attachment::Photo(p) => Some(&p.media),
            Attachment::Video(v) => Some(&v.media),
            Attachment::Audio(a) => Some(&a.media),
            Attachment::Doc(d) => Some(&d.media),
            Attachment::Sticker(s) => Some(&s.media),
            Attachment::Gift(g) => Some(&g.media),
            Attachment::Wall(w) => Some(&w.media),
            Attachment::Link(_) | Attachment::Other { .. } => None,
        }
    }

    /// Reference for re-sending this attachment, when it has one.
    pub fn prepared(&self) -> Option<String> {
        self.media().map(|media| media.prepared(self.kind()))
    }
}

impl<'de> Deserialize<'de> for Attachment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "type", default)]
            kind: String,
            #[serde(flatten)]
            rest: Map<String, Value>,
        }

        let Tagged { kind, mut rest } = Tagged::deserialize(deserializer)?;
        let content = rest
            .remove(&kind)
            .unwrap_or_else(|| Value::Object(Map::new()));

        let attachment = match kind.as_str() {
            "photo" => serde_json::from_value(content).map(Attachment::Photo),
            "video" => serde_json::from_value(content).map(Attachment::Video),
            "audio" => serde_json::from_value(content).map(Attachment::Audio),
            "doc" => serde_json::from_value(content).map(Attachment::Doc),
            "link" => serde_json::from_value(content).map(Attachment::Link),
            "sticker" => serde_json::from_value(content).map(Attachment::Sticker),
            "gift" => serde_json::from_value(content).map(Attachment::Gift),
            "wall" => serde_json::from_value(content).map(|wall| Attachment::Wall(Box::new(wall))),
            _ => Ok(Attachment::Other {
                kind: kind.clone(),
                content,
            }),
        };
        attachment.map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Photo {
    #[serde(flatten)]
    pub media: MediaId,
    pub album_id: i64,
    /// Uploader; 100 when uploaded by a community
    pub user_id: i64,
    pub text: String,
    pub date: i64,
    pub sizes: Vec<PhotoSize>,
}

impl Photo {
    pub fn uploaded_by_group(&self) -> bool {
        self.user_id == 100
    }

    pub fn largest(&self) -> Option<&PhotoSize> {
        self.sizes.iter().max_by_key(|s| u64::from(s.width) * u64::from(s.height))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PhotoSize {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Video {
    #[serde(flatten)]
    pub media: MediaId,
    pub title: String,
    pub description: String,
    pub duration: i64,
    pub date: i64,
    pub adding_date: i64,
    pub views: i64,
    pub comments: i64,
    pub player: String,
    pub photo_1280: Option<String>,
    pub photo_800: Option<String>,
    pub photo_640: Option<String>,
    pub photo_320: Option<String>,
    pub photo_130: Option<String>,
    pub first_frame_1280: Option<String>,
    pub first_frame_800: Option<String>,
    pub first_frame_640: Option<String>,
    pub first_frame_320: Option<String>,
    pub first_frame_130: Option<String>,
}

impl Video {
    /// Largest available cover.
    pub fn photo(&self) -> Option<&str> {
        first_present(&[
            &self.photo_1280,
            &self.photo_800,
            &self.photo_640,
            &self.photo_320,
            &self.photo_130,
        ])
    }

    /// Largest available first frame.
    pub fn first_frame(&self) -> Option<&str> {
        first_present(&[
            &self.first_frame_1280,
            &self.first_frame_800,
            &self.first_frame_640,
            &self.first_frame_320,
            &self.first_frame_130,
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Audio {
    #[serde(flatten)]
    pub media: MediaId,
    pub artist: String,
    pub title: String,
    pub duration: i64,
    pub url: String,
    pub lyrics_id: i64,
    pub album_id: i64,
    pub genre_id: i64,
    pub date: i64,
    #[serde(deserialize_with = "flag")]
    pub is_hq: bool,
    #[serde(deserialize_with = "flag")]
    pub is_explicit: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Doc {
    #[serde(flatten)]
    pub media: MediaId,
    pub title: String,
    pub size: u64,
    pub ext: String,
    pub url: String,
    pub date: i64,
    #[serde(rename = "type")]
    pub file_type: i64,
    /// Photo, graffiti or audio message preview, kept raw
    pub preview: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Link {
    pub url: String,
    pub title: String,
    pub caption: String,
    pub description: String,
    pub photo: Option<Photo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Sticker {
    #[serde(flatten)]
    pub media: MediaId,
    pub product_id: i64,
    pub sticker_id: i64,
    pub images: Vec<StickerSize>,
    pub images_with_background: Vec<StickerSize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StickerSize {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Gift {
    #[serde(flatten)]
    pub media: MediaId,
    pub thumb_256: String,
    pub thumb_96: String,
    pub thumb_48: String,
}

/// Wall post. Reposts nest through `copy_history`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Wall {
    #[serde(flatten)]
    pub media: MediaId,
    pub from_id: i64,
    pub date: i64,
    pub text: String,
    pub reply_owner_id: i64,
    pub reply_post_id: i64,
    pub comments: Counter,
    pub likes: Counter,
    pub reposts: Counter,
    pub views: Counter,
    pub post_type: String,
    pub post_source: Value,
    pub attachments: Vec<Attachment>,
    pub copy_history: Vec<Wall>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Counter {
    pub count: i64,
}

/// VK sends flags as `0`/`1` as often as `false`/`true`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    })
}

fn first_present<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .find(|s| !s.is_empty())
}
