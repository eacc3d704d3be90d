use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

/// Current schema version of the channel and settings catalogues.
pub const CATALOGUE_VERSION: u32 = 1;

/// One authenticated destination identity.
///
/// Everything except `channel_id` and `title` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub custom_url: String,
    #[serde(default)]
    pub subscriber_count: u64,
    #[serde(default)]
    pub video_count: u64,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub thumbnail_url: String,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            title: title.into(),
            description: String::new(),
            custom_url: String::new(),
            subscriber_count: 0,
            video_count: 0,
            view_count: 0,
            thumbnail_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    #[default]
    Unlisted,
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Unlisted => "unlisted",
            Visibility::Public => "public",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Visibility::Private),
            "unlisted" => Ok(Visibility::Unlisted),
            "public" => Ok(Visibility::Public),
            other => Err(format!("unknown privacy status '{}'", other)),
        }
    }
}

/// Upload defaults for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub channel_id: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default = "default_category")]
    pub category_id: String,
    #[serde(default = "default_description")]
    pub description_template: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Playlist the upload should land in
    #[serde(default)]
    pub playlist_id: Option<String>,
}

fn default_category() -> String {
    "20".to_string()
}

fn default_description() -> String {
    "Auto-uploaded ShadowPlay clip".to_string()
}

impl ChannelSettings {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            visibility: Visibility::default(),
            category_id: default_category(),
            description_template: default_description(),
            tags: Vec::new(),
            playlist_id: None,
        }
    }
}

/// Totals over the cached channel metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatistics {
    pub total_channels: usize,
    pub active_channel: Option<String>,
    pub total_subscribers: u64,
    pub total_videos: u64,
    pub total_views: u64,
}

/// On-disk shape of `channels.json`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChannelCatalogue {
    pub version: u32,
    #[serde(default)]
    pub active: Option<String>,
    pub channels: BTreeMap<String, Channel>,
}

/// On-disk shape of `channel_settings.json`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SettingsCatalogue {
    pub version: u32,
    pub settings: BTreeMap<String, ChannelSettings>,
}
