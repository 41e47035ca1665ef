use std::{path::PathBuf, sync::Arc};

use crate::messaging::{
    port::ChatClient,
    types::{FileType, InlineKeyboard, SourceMessage},
};

/// One message in flight through the pipeline.
///
/// Stages mutate the derived fields in place; `source` never changes. A regenerated
/// attachment marked `cleanup` is removed from disk when the envelope is dropped.
pub struct Envelope {
    pub source: Arc<SourceMessage>,
    pub text: String,
    pub raw_text: String,
    /// Text has been converted to HTML by the format stage.
    pub html: bool,
    pub file_type: FileType,
    pub new_file: Option<PathBuf>,
    pub cleanup: bool,
    pub buttons: Option<InlineKeyboard>,
    pub sender_id: Option<i64>,
    pub client: Arc<dyn ChatClient>,
}

impl Envelope {
    pub fn new(source: SourceMessage, client: Arc<dyn ChatClient>) -> Self {
        let source = Arc::new(source);
        Self {
            text: source.text.clone(),
            raw_text: source.text.clone(),
            html: false,
            file_type: source.file_type(),
            new_file: None,
            cleanup: false,
            buttons: source.buttons.clone().filter(|b| !b.is_empty()),
            sender_id: source.sender.map(|s| s.id),
            client,
            source,
        }
    }

    /// Attach a locally generated file owned by this envelope.
    pub fn set_new_file(&mut self, path: PathBuf) {
        self.remove_owned_file();
        self.new_file = Some(path);
        self.cleanup = true;
    }

    pub fn has_media(&self) -> bool {
        self.new_file.is_some() || self.source.media.is_some()
    }

    fn remove_owned_file(&mut self) {
        if !self.cleanup {
            return;
        }
        if let Some(path) = self.new_file.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!("failed to remove {}: {e}", path.display());
            }
        }
        self.cleanup = false;
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        self.remove_owned_file();
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("chat", &self.source.chat_id)
            .field("id", &self.source.id)
            .field("text", &self.text)
            .field("file_type", &self.file_type)
            .field("new_file", &self.new_file)
            .finish()
    }
}
