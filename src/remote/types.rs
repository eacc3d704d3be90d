use std::path::Path;
use chrono::Local;
use serde::{Deserialize, Serialize};
use crate::channel::ChannelSettings;
use crate::core::RemoteObjectId;

/// Resumable session returned by `initiate_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Session location, e.g. the upload URL for HTTP services
    pub location: String,
}

impl SessionHandle {
    pub fn new(location: impl Into<String>) -> Self {
        Self { location: location.into() }
    }
}

/// Result of sending one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// The service committed bytes `0..committed` and expects more
    Progress { committed: u64 },
    /// The upload is finished
    Completed(RemoteObjectId),
}

/// Video resource sent when a session is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: String,
    pub description: String,
    pub category_id: String,
    pub privacy_status: String,
    pub tags: Vec<String>,
    pub playlist_id: Option<String>,
}

impl VideoMetadata {
    /// Builds metadata for `file_path` from a channel's upload defaults.
    ///
    /// The title is the file stem. The description template may reference
    /// `{filename}`, `{title}` and `{date}`.
    pub fn from_settings(settings: &ChannelSettings, file_path: &Path) -> Self {
        let title = file_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filename = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let date = Local::now().format("%Y-%m-%d").to_string();

        let description = settings
            .description_template
            .replace("{filename}", &filename)
            .replace("{title}", &title)
            .replace("{date}", &date);

        Self {
            title,
            description,
            category_id: settings.category_id.clone(),
            privacy_status: settings.visibility.as_str().to_string(),
            tags: settings.tags.clone(),
            playlist_id: settings.playlist_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Visibility;

    #[test]
    fn metadata_renders_template_placeholders() {
        let mut settings = ChannelSettings::new("UC1");
        settings.description_template = "{title} from {filename}".to_string();
        settings.visibility = Visibility::Private;
        settings.tags = vec!["clips".to_string()];

        let meta = VideoMetadata::from_settings(&settings, Path::new("/videos/Match 01.mp4"));
        assert_eq!(meta.title, "Match 01");
        assert_eq!(meta.description, "Match 01 from Match 01.mp4");
        assert_eq!(meta.privacy_status, "private");
        assert_eq!(meta.category_id, "20");
        assert_eq!(meta.tags, vec!["clips".to_string()]);
    }
}
